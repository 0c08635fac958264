//! Handle-based transfer of model inputs/outputs between callers and workers.
//!
//! A fixed-capacity ring of tensor slots; `alloc` hands out a monotonically
//! increasing handle valid only while it names a slot still in the window
//! `[head - size, head)`. Reuses `timely_bytes`'s `Arc`-backed byte slice for
//! each tensor's payload, the same disjoint-mutable-slice discipline the
//! teacher crate uses for message buffers.

use std::sync::Mutex;

use smallvec::SmallVec;
use thiserror::Error;
use timely_bytes::arc::Bytes;

/// Default ring capacity, matching the runtime's configured default.
pub const DEFAULT_CAPACITY: usize = 64;

/// Most tensors carry a handful of dimensions; inline storage avoids a heap
/// allocation per shape in the common case.
pub type Shape = SmallVec<[usize; 4]>;

/// One tensor's payload and the element type tag it carries.
pub struct Tensor {
    pub element_type: usize,
    pub shape: Shape,
    pub data: Bytes<Vec<u8>>,
}

impl Tensor {
    pub fn from_bytes(element_type: usize, shape: impl Into<Shape>, data: Vec<u8>) -> Self {
        Tensor { element_type, shape: shape.into(), data: Bytes::from(data) }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl Clone for Tensor {
    /// `Bytes` deliberately has no `Clone` impl of its own — it hands out
    /// disjoint sub-ranges of one allocation rather than aliasing it. The
    /// ring buffer's contract is to *copy* tensor payloads in and out (§4.G),
    /// so cloning a `Tensor` makes a fresh owned allocation rather than
    /// sharing the original one.
    fn clone(&self) -> Self {
        Tensor::from_bytes(self.element_type, self.shape.clone(), self.data.to_vec())
    }
}

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("handle {0} has aged out of the ring buffer window")]
    HandleExpired(u64),
    #[error("expected {expected} tensors, got {actual}")]
    TensorShapeMismatch { expected: usize, actual: usize },
}

struct Slot {
    tensors: Vec<Tensor>,
    /// The handle value this slot was last allocated under; `Get`/`Put`
    /// validate against this rather than trusting the caller's arithmetic.
    handle: u64,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    head: u64,
}

/// Fixed-capacity ring of tensor slots, serialized on a single mutex.
pub struct TensorRingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl TensorRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        TensorRingBuffer {
            inner: Mutex::new(Inner { slots: (0..capacity).map(|_| None).collect(), head: 0 }),
            capacity,
        }
    }

    /// Allocates a fresh handle and stores `tensors` under it, returning the handle.
    pub fn alloc(&self, tensors: Vec<Tensor>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.head;
        let slot_idx = (handle as usize) % self.capacity;
        inner.slots[slot_idx] = Some(Slot { tensors, handle });
        inner.head += 1;
        handle
    }

    /// Whether `handle` still names a live slot (`head - size <= handle < head`).
    fn is_valid(inner: &Inner, handle: u64, capacity: usize) -> bool {
        handle < inner.head && inner.head - handle <= capacity as u64
    }

    /// Copies the tensors stored under `handle` out, failing if the handle
    /// has aged out of the window.
    pub fn get(&self, handle: u64) -> Result<Vec<Tensor>, TensorError> {
        let inner = self.inner.lock().unwrap();
        if !Self::is_valid(&inner, handle, self.capacity) {
            return Err(TensorError::HandleExpired(handle));
        }
        let slot_idx = (handle as usize) % self.capacity;
        match &inner.slots[slot_idx] {
            Some(slot) if slot.handle == handle => Ok(slot.tensors.clone()),
            _ => Err(TensorError::HandleExpired(handle)),
        }
    }

    /// Overwrites the tensors stored at `handle` in place, failing if the
    /// handle is expired or if `tensors.len()` does not match the existing count.
    pub fn put(&self, handle: u64, tensors: &[Tensor]) -> Result<(), TensorError> {
        let mut inner = self.inner.lock().unwrap();
        if !Self::is_valid(&inner, handle, self.capacity) {
            return Err(TensorError::HandleExpired(handle));
        }
        let slot_idx = (handle as usize) % self.capacity;
        match &mut inner.slots[slot_idx] {
            Some(slot) if slot.handle == handle => {
                if slot.tensors.len() != tensors.len() {
                    return Err(TensorError::TensorShapeMismatch {
                        expected: slot.tensors.len(),
                        actual: tensors.len(),
                    });
                }
                slot.tensors = tensors.to_vec();
                Ok(())
            }
            _ => Err(TensorError::HandleExpired(handle)),
        }
    }
}
