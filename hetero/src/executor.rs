//! Interfaces to the collaborators this crate treats as out of scope (§1):
//! the tensor operator kernels and the cloud worker's transport.
//!
//! Production embedders implement [`SubgraphExecutor`] against the real
//! interpreter and [`CloudClient`] against their RPC stack; tests use the
//! in-process stubs below.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::catalog::Subgraph;
use crate::tensor::Tensor;
use crate::worker::InvokeOutcome;

/// Invokes a compiled subgraph against caller-supplied input tensors.
///
/// The tensor operator kernels themselves are out of scope for this crate
/// (§1); this trait is the seam an embedder plugs its interpreter into.
pub trait SubgraphExecutor: Send + Sync {
    fn invoke(&self, subgraph: &Subgraph, inputs: &[Tensor]) -> Result<Vec<Tensor>, InvokeOutcome>;

    /// A cheap no-op invoke used by a worker's availability-recovery loop
    /// (§4.E step 8) to probe whether a delegate has come back.
    fn trivial_invoke(&self, subgraph: &Subgraph) -> Result<(), ()>;
}

/// A canned-output stub for tests: returns a fixed response (or a scripted
/// failure) per model id, regardless of input contents.
#[derive(Default)]
pub struct TableExecutor {
    pub responses: std::collections::HashMap<usize, Vec<Tensor>>,
    pub delegate_errors: std::collections::HashSet<usize>,
}

impl SubgraphExecutor for TableExecutor {
    fn invoke(&self, subgraph: &Subgraph, _inputs: &[Tensor]) -> Result<Vec<Tensor>, InvokeOutcome> {
        if self.delegate_errors.contains(&subgraph.model_id) {
            return Err(InvokeOutcome::DelegateError);
        }
        Ok(self.responses.get(&subgraph.model_id).cloned().unwrap_or_default())
    }

    fn trivial_invoke(&self, subgraph: &Subgraph) -> Result<(), ()> {
        if self.delegate_errors.contains(&subgraph.model_id) {
            Err(())
        } else {
            Ok(())
        }
    }
}

/// A request/response round trip to the cloud worker (§6 wire protocol).
#[derive(Debug, Clone)]
pub struct CloudRequest {
    pub model: String,
    pub height: u32,
    pub width: u32,
    pub data_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CloudResponse {
    pub computation_time: Duration,
    /// Signal-quality sample for this round trip, if the transport has one
    /// (§11 supplement — fed into the cloud thermal model's `rssi` feature).
    pub rssi: Option<f64>,
}

/// Transport seam for the cloud worker. The wall-clock round trip minus
/// `computation_time` is the communication time the cloud `ModelManager`
/// entries are updated with.
pub trait CloudClient: Send + Sync {
    fn invoke(&self, request: CloudRequest) -> Result<CloudResponse, InvokeOutcome>;
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    model: String,
    height: u32,
    width: u32,
    data_bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    computation_time_ms: u64,
}

/// A concrete §6 wire-protocol `CloudClient`: a length-prefixed (`u32`
/// little-endian, via `byteorder`) `bincode` payload over any `Read + Write`
/// transport. The caller measures the wall-clock round trip and derives
/// `comm_time = latency - computation_time` itself (`ModelManager::update_cloud_latency`);
/// this client only performs the request/response exchange.
pub struct FramedCloudClient<S> {
    stream: Mutex<S>,
}

impl<S: Read + Write + Send> FramedCloudClient<S> {
    pub fn new(stream: S) -> Self {
        FramedCloudClient { stream: Mutex::new(stream) }
    }

    fn roundtrip(&self, wire: &WireRequest) -> std::io::Result<WireResponse> {
        let payload = bincode::serialize(wire).map_err(std::io::Error::other)?;
        let mut stream = self.stream.lock().unwrap();
        stream.write_u32::<LittleEndian>(payload.len() as u32)?;
        stream.write_all(&payload)?;
        let len = stream.read_u32::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        bincode::deserialize(&buf).map_err(std::io::Error::other)
    }
}

impl<S: Read + Write + Send> CloudClient for FramedCloudClient<S> {
    fn invoke(&self, request: CloudRequest) -> Result<CloudResponse, InvokeOutcome> {
        let wire = WireRequest {
            model: request.model,
            height: request.height,
            width: request.width,
            data_bytes: request.data_bytes,
        };
        let response = self.roundtrip(&wire).map_err(|_| InvokeOutcome::Other)?;
        Ok(CloudResponse { computation_time: Duration::from_millis(response.computation_time_ms), rssi: None })
    }
}
