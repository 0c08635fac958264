//! Execution contexts, one per accelerator.
//!
//! Two queue disciplines share one run loop shape: [`DeviceQueueWorker`]
//! keeps a FIFO and pulls jobs off the head; [`GlobalQueueWorker`] holds at
//! most one job at a time and rejects further work until it reports back.
//! Both are driven by their own dedicated OS thread, woken by a condvar,
//! single-threaded-cooperative within that thread — no nested work.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::catalog::{Subgraph, SubgraphCatalog};
use crate::executor::SubgraphExecutor;
use crate::job::{Job, JobStatus, WorkerId};
use crate::models::ModelManager;
use crate::tensor::TensorRingBuffer;

/// Immutable bitset of logical CPUs a worker thread is pinned to.
#[derive(Debug, Clone)]
pub struct CpuSet {
    pub cores: Vec<core_affinity::CoreId>,
}

impl CpuSet {
    /// Resolves a named mask (`all`, `little`, `big`, `primary`) against the
    /// cores `core_affinity` reports for this host. Unknown names or hosts
    /// without affinity support degrade to an empty set (a documented no-op
    /// at pin time), matching the original runtime's "unsupported platform"
    /// posture rather than erroring.
    pub fn named(mask: &str) -> CpuSet {
        let all = core_affinity::get_core_ids().unwrap_or_default();
        let cores = match mask {
            "all" => all,
            "primary" => all.into_iter().take(1).collect(),
            // Without per-core frequency topology available at this layer,
            // `little`/`big` fall back to the lower/upper half of the id
            // range, which is the common big.LITTLE enumeration convention.
            "little" => {
                let half = all.len() / 2;
                all.into_iter().take(half.max(1)).collect()
            }
            "big" => {
                let half = all.len() / 2;
                all.into_iter().skip(half).collect()
            }
            _ => Vec::new(),
        };
        CpuSet { cores }
    }

    pub fn pin_current_thread(&self) {
        for core in &self.cores {
            core_affinity::set_for_current(*core);
            break; // pin to the first core in the set; a full mask needs OS-level affinity APIs beyond core_affinity's scope.
        }
    }
}

/// Outcome of invoking a subgraph, distinguishing the one error kind that is
/// recovered locally (§7) from everything else.
#[derive(Debug)]
pub enum InvokeOutcome {
    Success,
    /// The delegate itself failed; the worker should mark itself unavailable
    /// and retry, not fail the job outright.
    DelegateError,
    /// Any other failure: the job is marked `invoke_failure` and does not retry.
    Other,
}

/// A planner-facing handle to a worker: the capability `give`/`waiting_time`/
/// `pause`/`resume` set named in Design Note §9, replacing a deep class
/// hierarchy with one trait object the planner dispatches through uniformly.
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> WorkerId;
    /// Attempts to hand `job` to this worker; `false` if paused/unavailable
    /// (DeviceQueue) or already busy (GlobalQueue).
    fn give_job(&self, job: Job, subgraph_idx: usize) -> bool;
    fn waiting_time(&self, models: &ModelManager, catalog: &SubgraphCatalog) -> Duration;
    fn pause(&self);
    fn resume(&self);
    fn kill(&self);
    /// Number of jobs currently queued (0 or 1 for `GlobalQueueWorker`).
    fn queue_len(&self) -> usize {
        0
    }
    /// Clones the tail (most recently queued) job without removing it, for
    /// work-stealing candidate evaluation. `None` for workers that never
    /// participate in stealing.
    fn peek_tail(&self) -> Option<Job> {
        None
    }
    /// Removes the tail job if it still is the tail, still matches
    /// `job_id`, and has not started invoking; returns it along with its
    /// subgraph index so the stealer can re-key it.
    fn steal_tail(&self, _job_id: u64) -> Option<(Job, usize)> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Unavailable,
    Paused,
}

struct QueueEntry {
    job: Job,
    subgraph_idx: usize,
}

struct Shared {
    state: Mutex<RunState>,
    cv: Condvar,
    kill: Mutex<bool>,
    queue: Mutex<VecDeque<QueueEntry>>,
    /// Set once a job is mid-invoke, so `waiting_time` can subtract progress.
    invoking_since: Mutex<Option<(usize, Instant)>>,
    cpu_set: Mutex<CpuSet>,
}

/// FIFO-queue worker: accepts any number of jobs, executes them in arrival order.
pub struct DeviceQueueWorker {
    id: WorkerId,
    shared: Arc<Shared>,
    allow_work_steal: bool,
    availability_check_interval: Duration,
    finished_tx: Sender<Job>,
}

impl DeviceQueueWorker {
    pub fn new(
        id: WorkerId,
        cpu_set: CpuSet,
        allow_work_steal: bool,
        availability_check_interval: Duration,
        finished_tx: Sender<Job>,
    ) -> Arc<Self> {
        Arc::new(DeviceQueueWorker {
            id,
            shared: Arc::new(Shared {
                state: Mutex::new(RunState::Running),
                cv: Condvar::new(),
                kill: Mutex::new(false),
                queue: Mutex::new(VecDeque::new()),
                invoking_since: Mutex::new(None),
                cpu_set: Mutex::new(cpu_set),
            }),
            allow_work_steal,
            availability_check_interval,
            finished_tx,
        })
    }

    /// Runs the worker's loop on the calling thread; callers spawn this on a
    /// dedicated `thread::Builder` and pin it with `CpuSet::pin_current_thread`.
    pub fn run(
        self: &Arc<Self>,
        catalog: &SubgraphCatalog,
        models: &Mutex<ModelManager>,
        executor: &dyn SubgraphExecutor,
        tensors: &TensorRingBuffer,
        peers: &[Arc<dyn WorkerHandle>],
    ) {
        self.shared.cpu_set.lock().unwrap().pin_current_thread();
        loop {
            let guard = self.shared.state.lock().unwrap();
            let guard = self
                .shared
                .cv
                .wait_while(guard, |state| {
                    let killed = *self.shared.kill.lock().unwrap();
                    let has_work = !self.shared.queue.lock().unwrap().is_empty();
                    !killed && (!has_work || *state == RunState::Paused)
                })
                .unwrap();
            if *self.shared.kill.lock().unwrap() {
                return;
            }
            let paused = *guard == RunState::Paused;
            drop(guard);
            if paused {
                continue;
            }

            let Some(entry) = self.shared.queue.lock().unwrap().pop_front() else { continue };
            self.execute_one(entry, catalog, models, executor, tensors);

            if self.allow_work_steal && self.shared.queue.lock().unwrap().is_empty() {
                self.try_work_steal(catalog, models, peers);
            }
        }
    }

    fn execute_one(
        self: &Arc<Self>,
        mut entry: QueueEntry,
        catalog: &SubgraphCatalog,
        models: &Mutex<ModelManager>,
        executor: &dyn SubgraphExecutor,
        tensors: &TensorRingBuffer,
    ) {
        let subgraph = catalog.get(entry.subgraph_idx).clone();
        entry.job.worker_id = Some(self.id);
        entry.job.subgraph_idx = Some(entry.subgraph_idx);

        let Ok(inputs) = try_copy_input_tensors(&entry.job, &subgraph, tensors) else {
            entry.job.status = JobStatus::InputCopyFailure;
            entry.job.end_time = Some(Instant::now());
            let _ = self.finished_tx.send(entry.job);
            return;
        };

        entry.job.invoke_time = Some(Instant::now());
        *self.shared.invoking_since.lock().unwrap() = Some((entry.subgraph_idx, Instant::now()));
        let outcome = executor.invoke(&subgraph, &inputs);
        *self.shared.invoking_since.lock().unwrap() = None;

        match outcome {
            Ok(outputs) => {
                entry.job.end_time = Some(Instant::now());
                entry.job.profiled_latency = entry
                    .job
                    .invoke_time
                    .zip(entry.job.end_time)
                    .map(|(s, e)| e.saturating_duration_since(s));
                models.lock().unwrap().update(&entry.job, &subgraph);
                if let Some(handle) = entry.job.output_handle {
                    if tensors.put(handle, &outputs).is_err() {
                        entry.job.status = JobStatus::OutputCopyFailure;
                        let _ = self.finished_tx.send(entry.job);
                        return;
                    }
                }
                entry.job.status = JobStatus::Success;
                let following = std::mem::take(&mut entry.job.following_jobs);
                let _ = self.finished_tx.send(entry.job);
                for job in following {
                    let _ = self.finished_tx.send(job);
                }
            }
            Err(InvokeOutcome::DelegateError) => {
                *self.shared.state.lock().unwrap() = RunState::Unavailable;
                let stranded: Vec<QueueEntry> = self.shared.queue.lock().unwrap().drain(..).collect();
                for mut stuck in stranded {
                    stuck.job.status = JobStatus::Queued;
                    let _ = self.finished_tx.send(stuck.job);
                }
                self.wait_until_available(executor, &subgraph);
                entry.job.status = JobStatus::InvokeFailure;
                let _ = self.finished_tx.send(entry.job);
            }
            Err(InvokeOutcome::Other) => {
                entry.job.status = JobStatus::InvokeFailure;
                entry.job.end_time = Some(Instant::now());
                let _ = self.finished_tx.send(entry.job);
            }
        }
    }

    fn wait_until_available(&self, executor: &dyn SubgraphExecutor, subgraph: &Subgraph) {
        loop {
            std::thread::sleep(self.availability_check_interval);
            if executor.trivial_invoke(subgraph).is_ok() {
                *self.shared.state.lock().unwrap() = RunState::Running;
                return;
            }
        }
    }

    /// Considers stealing the tail job of each peer with at least two queued
    /// jobs, picking the move with the largest positive
    /// `waiting_time - alt_latency` among moves whose re-keyed subgraph exists.
    /// Moves never touch a job whose `invoke_time` is set, since `peek_tail`/
    /// `steal_tail` only ever expose the not-yet-invoking tail of a queue.
    fn try_work_steal(self: &Arc<Self>, catalog: &SubgraphCatalog, models: &Mutex<ModelManager>, peers: &[Arc<dyn WorkerHandle>]) {
        let mut best: Option<(f64, Arc<dyn WorkerHandle>, Job, usize)> = None;
        for peer in peers {
            if peer.id() == self.id || peer.queue_len() < 2 {
                continue;
            }
            let Some(tail) = peer.peek_tail() else { continue };
            if tail.invoke_time.is_some() {
                continue;
            }
            let Some(alt_idx) = catalog.subgraph_idx(tail.model_id, self.id) else { continue };
            let alt_latency = models.lock().unwrap().predicted_latency(self.id, catalog.get(alt_idx));
            let peer_waiting = peer.waiting_time(&models.lock().unwrap(), catalog);
            let gain = peer_waiting.as_secs_f64() - alt_latency.as_secs_f64();
            if gain > 0.0 && best.as_ref().map_or(true, |(g, ..)| gain > *g) {
                best = Some((gain, Arc::clone(peer), tail, alt_idx));
            }
        }
        if let Some((_, peer, tail, alt_idx)) = best {
            if let Some((job, _)) = peer.steal_tail(tail.job_id) {
                self.give_job(job, alt_idx);
            }
        }
    }
}

impl WorkerHandle for DeviceQueueWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn give_job(&self, job: Job, subgraph_idx: usize) -> bool {
        let state = *self.shared.state.lock().unwrap();
        if state != RunState::Running {
            return false;
        }
        self.shared.queue.lock().unwrap().push_back(QueueEntry { job, subgraph_idx });
        self.shared.cv.notify_one();
        true
    }

    fn waiting_time(&self, models: &ModelManager, catalog: &SubgraphCatalog) -> Duration {
        let queue = self.shared.queue.lock().unwrap();
        let mut total = Duration::ZERO;
        for entry in queue.iter() {
            total += models.predicted_latency(self.id, catalog.get(entry.subgraph_idx));
        }
        if let Some((subgraph_idx, since)) = *self.shared.invoking_since.lock().unwrap() {
            let predicted = models.predicted_latency(self.id, catalog.get(subgraph_idx));
            let elapsed = since.elapsed();
            total += predicted.saturating_sub(elapsed);
        }
        total
    }

    fn pause(&self) {
        *self.shared.state.lock().unwrap() = RunState::Paused;
    }

    fn resume(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == RunState::Paused {
            *state = RunState::Running;
        }
        drop(state);
        self.shared.cv.notify_one();
    }

    fn kill(&self) {
        *self.shared.kill.lock().unwrap() = true;
        self.shared.cv.notify_one();
    }

    fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    fn peek_tail(&self) -> Option<Job> {
        self.shared.queue.lock().unwrap().back().map(|e| e.job.clone())
    }

    fn steal_tail(&self, job_id: u64) -> Option<(Job, usize)> {
        let mut queue = self.shared.queue.lock().unwrap();
        let matches = queue.back().is_some_and(|e| e.job.job_id == job_id && e.job.invoke_time.is_none());
        if matches {
            let entry = queue.pop_back()?;
            Some((entry.job, entry.subgraph_idx))
        } else {
            None
        }
    }
}

/// Single-slot worker: busy with at most one job, rejects `give_job` until it reports back.
pub struct GlobalQueueWorker {
    id: WorkerId,
    shared: Arc<Shared>,
    finished_tx: Sender<Job>,
}

impl GlobalQueueWorker {
    pub fn new(id: WorkerId, cpu_set: CpuSet, finished_tx: Sender<Job>) -> Arc<Self> {
        Arc::new(GlobalQueueWorker {
            id,
            shared: Arc::new(Shared {
                state: Mutex::new(RunState::Running),
                cv: Condvar::new(),
                kill: Mutex::new(false),
                queue: Mutex::new(VecDeque::new()),
                invoking_since: Mutex::new(None),
                cpu_set: Mutex::new(cpu_set),
            }),
            finished_tx,
        })
    }

    pub fn run(
        self: &Arc<Self>,
        catalog: &SubgraphCatalog,
        models: &Mutex<ModelManager>,
        executor: &dyn SubgraphExecutor,
        tensors: &TensorRingBuffer,
    ) {
        self.shared.cpu_set.lock().unwrap().pin_current_thread();
        loop {
            let guard = self.shared.state.lock().unwrap();
            let guard = self
                .shared
                .cv
                .wait_while(guard, |state| {
                    let killed = *self.shared.kill.lock().unwrap();
                    let has_work = !self.shared.queue.lock().unwrap().is_empty();
                    !killed && (!has_work || *state == RunState::Paused)
                })
                .unwrap();
            if *self.shared.kill.lock().unwrap() {
                return;
            }
            drop(guard);
            let Some(entry) = self.shared.queue.lock().unwrap().pop_front() else { continue };
            // GlobalQueue reuses the same execution path as DeviceQueue; the
            // distinction is purely in `give_job`'s single-slot rejection.
            let device_queue_shim = DeviceQueueWorker {
                id: self.id,
                shared: Arc::clone(&self.shared),
                allow_work_steal: false,
                availability_check_interval: Duration::from_millis(100),
                finished_tx: self.finished_tx.clone(),
            };
            Arc::new(device_queue_shim).execute_one(entry, catalog, models, executor, tensors);
        }
    }
}

impl WorkerHandle for GlobalQueueWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn give_job(&self, job: Job, subgraph_idx: usize) -> bool {
        let state = *self.shared.state.lock().unwrap();
        if state != RunState::Running {
            return false;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if !queue.is_empty() {
            return false;
        }
        queue.push_back(QueueEntry { job, subgraph_idx });
        self.shared.cv.notify_one();
        true
    }

    fn waiting_time(&self, models: &ModelManager, catalog: &SubgraphCatalog) -> Duration {
        let Some((subgraph_idx, since)) = *self.shared.invoking_since.lock().unwrap() else {
            return Duration::ZERO;
        };
        let predicted = models.predicted_latency(self.id, catalog.get(subgraph_idx));
        predicted.saturating_sub(since.elapsed())
    }

    fn pause(&self) {
        *self.shared.state.lock().unwrap() = RunState::Paused;
    }

    fn resume(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == RunState::Paused {
            *state = RunState::Running;
        }
        drop(state);
        self.shared.cv.notify_one();
    }

    fn kill(&self) {
        *self.shared.kill.lock().unwrap() = true;
        self.shared.cv.notify_one();
    }
}

/// Resolves each of `subgraph`'s input tensors from either a prior
/// subgraph's output already recorded on the job, or the model's own input
/// buffer via `job.input_handle`. Fails with `Err(())` (surfaced by the
/// caller as `input_copy_failure`) if any input tensor is unresolved.
fn try_copy_input_tensors(job: &Job, subgraph: &Subgraph, tensors: &TensorRingBuffer) -> Result<Vec<crate::tensor::Tensor>, ()> {
    let mut resolved = Vec::with_capacity(subgraph.inputs.len());
    for &tensor_idx in &subgraph.inputs {
        if job.resolved_tensors.contains(&tensor_idx) {
            // Already produced by a previous subgraph in this request; the
            // planner/worker chain is expected to have staged it in the ring
            // buffer under `job.input_handle` alongside freshly-supplied inputs.
            if let Some(handle) = job.input_handle {
                if let Ok(values) = tensors.get(handle) {
                    resolved.extend(values);
                    continue;
                }
            }
            return Err(());
        } else if let Some(handle) = job.input_handle {
            match tensors.get(handle) {
                Ok(values) => resolved.extend(values),
                Err(_) => return Err(()),
            }
        } else {
            return Err(());
        }
    }
    Ok(resolved)
}
