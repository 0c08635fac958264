//! Identifiers and lifecycle records for inference requests.
//!
//! A [`Job`] is created once per client request and, when a model is split
//! across workers, once more per continuation. The planner mutates only
//! the scheduling fields; the owning worker mutates only the invoke/end
//! timestamps and the terminal status.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Dense enumeration of accelerator kinds a worker can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    Cpu,
    CpuFallback,
    Gpu,
    Dsp,
    Npu,
    Cloud,
}

impl DeviceId {
    /// All device kinds, in enumeration order, excluding the sentinel.
    pub const ALL: [DeviceId; 6] = [
        DeviceId::Cpu,
        DeviceId::CpuFallback,
        DeviceId::Gpu,
        DeviceId::Dsp,
        DeviceId::Npu,
        DeviceId::Cloud,
    ];

    /// Dense index matching `ALL`'s order — the numeric `device_id` column
    /// the job log (§6) writes.
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|&d| d == self).expect("DeviceId::ALL is exhaustive")
    }
}

/// Dense, stable scheduler policy identifiers (§6 of the runtime contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedulerId {
    FixedDevice = 0,
    RoundRobin = 1,
    ShortestExpectedLatency = 2,
    FixedDeviceGlobalQueue = 3,
    Heft = 4,
    HeftReserved = 5,
    LeastSlackFirst = 6,
    ThermalAware = 7,
    Offloading = 8,
    RandomAssign = 9,
}

/// Terminal or in-flight status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Success,
    SloViolation,
    InputCopyFailure,
    OutputCopyFailure,
    InvokeFailure,
}

impl JobStatus {
    /// Whether this status represents the job having finished (successfully or not).
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued)
    }
}

/// Index into the global [`crate::catalog::SubgraphCatalog`].
pub type SubgraphIdx = usize;

/// An opaque index into a worker's id space, assigned at worker registration.
pub type WorkerId = usize;

/// Key identifying a compiled execution unit: a model's op range bound to one worker.
///
/// Two keys are equal iff all four fields are equal; ordering is the
/// lexicographic tuple order, which is also the order `BTreeSet` gives the
/// op sets, so derived `Ord` is exactly the ordering the runtime needs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubgraphKey {
    pub model_id: usize,
    pub worker_id: WorkerId,
    pub input_ops: BTreeSet<usize>,
    pub output_ops: BTreeSet<usize>,
}

impl SubgraphKey {
    pub fn new(
        model_id: usize,
        worker_id: WorkerId,
        input_ops: BTreeSet<usize>,
        output_ops: BTreeSet<usize>,
    ) -> Self {
        SubgraphKey { model_id, worker_id, input_ops, output_ops }
    }

    /// Sorted, comma-joined rendering of `input_ops` — the only externally
    /// exposed representation of this set (job logs, diagnostics).
    pub fn input_ops_string(&self) -> String {
        join_ops(&self.input_ops)
    }

    /// Sorted, comma-joined rendering of `output_ops`.
    pub fn output_ops_string(&self) -> String {
        join_ops(&self.output_ops)
    }
}

fn join_ops(ops: &BTreeSet<usize>) -> String {
    ops.iter().map(|op| op.to_string()).collect::<Vec<_>>().join(",")
}

/// A single inference request, or a continuation of one.
///
/// `job_id` is assigned once, at first enqueue, and is monotonically
/// increasing across the lifetime of a [`crate::planner::Planner`].
/// `request_id` stays fixed across all continuations spawned for one
/// client request.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u64,
    pub request_id: u64,
    pub model_id: usize,
    /// The model's display name, for diagnostics and the job log (§6);
    /// empty unless the embedder sets it before enqueueing.
    pub model_name: String,
    /// Deadline in microseconds from `enqueue_time`; 0 means no SLO.
    pub slo_us: u64,
    pub enqueue_time: Option<Instant>,
    pub invoke_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub status: JobStatus,
    /// -1 (`None`) until the planner schedules this job onto a subgraph.
    pub subgraph_idx: Option<SubgraphIdx>,
    pub worker_id: Option<WorkerId>,
    pub expected_latency: Option<Duration>,
    pub profiled_latency: Option<Duration>,
    /// Ring-buffer handle for this job's input tensors; `None` for compute-only jobs.
    pub input_handle: Option<u64>,
    /// Ring-buffer handle for this job's output tensors; `None` if the caller discards them.
    pub output_handle: Option<u64>,
    /// Tensor indices already produced by prior subgraphs in this request.
    pub resolved_tensors: BTreeSet<usize>,
    pub previous_subgraph_indices: Vec<SubgraphIdx>,
    /// Continuation jobs spawned once this job's subgraph completes.
    pub following_jobs: Vec<Job>,
    pub thermal_before: Vec<f64>,
    pub thermal_after: Vec<f64>,
    pub frequency_before: Vec<f64>,
    /// Which scheduler placed this job, stamped by the planner at dispatch
    /// time; `None` until placed. Carried for the job log's `sched_id` column.
    pub placed_by: Option<SchedulerId>,
}

impl Job {
    /// A freshly created, unscheduled job for `model_id`.
    pub fn new(request_id: u64, model_id: usize, slo_us: u64) -> Self {
        Job {
            job_id: 0,
            request_id,
            model_id,
            model_name: String::new(),
            slo_us,
            enqueue_time: None,
            invoke_time: None,
            end_time: None,
            status: JobStatus::Queued,
            subgraph_idx: None,
            worker_id: None,
            expected_latency: None,
            profiled_latency: None,
            input_handle: None,
            output_handle: None,
            resolved_tensors: BTreeSet::new(),
            previous_subgraph_indices: Vec::new(),
            following_jobs: Vec::new(),
            thermal_before: Vec::new(),
            thermal_after: Vec::new(),
            frequency_before: Vec::new(),
            placed_by: None,
        }
    }

    /// Whether `enqueue_time + slo_us` has already passed relative to `now`.
    pub fn slo_expired(&self, now: Instant) -> bool {
        if self.slo_us == 0 {
            return false;
        }
        match self.enqueue_time {
            Some(enq) => now.saturating_duration_since(enq) > Duration::from_micros(self.slo_us),
            None => false,
        }
    }

    /// Microseconds remaining before the SLO expires, if any is set.
    pub fn slack(&self, now: Instant) -> Option<Duration> {
        if self.slo_us == 0 {
            return None;
        }
        let enq = self.enqueue_time?;
        let deadline = enq + Duration::from_micros(self.slo_us);
        Some(deadline.saturating_duration_since(now))
    }
}
