//! The planner: owns the global request queue, runs the scheduling loop on
//! its own thread, and is the client-facing entry point for submitting work.
//!
//! Grounded on the original runtime's `planner.h`/`planner.cc`: a
//! mutex+condvar-guarded request queue, a dense ring of recently finished
//! jobs kept for `wait`/diagnostics, and a main loop that drains the local
//! queue through each registered scheduler in priority order before
//! sleeping again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Select, Sender};

use crate::catalog::SubgraphCatalog;
use crate::job::{Job, JobStatus, SchedulerId, WorkerId};
use crate::models::ModelManager;
use crate::persist::JobLogWriter;
use crate::scheduler::{Scheduler, ScheduleContext};
use crate::tensor::TensorRingBuffer;
use crate::worker::WorkerHandle;

/// Number of recently finished jobs kept for `finished_job`/diagnostics,
/// indexed `job_id % NUM_FINISHED_RECORDS`.
pub const NUM_FINISHED_RECORDS: usize = 1000;

struct RequestQueue {
    items: Mutex<VecDeque<Job>>,
    /// Pinged on every `push`; the planner's idle wait selects on the
    /// receiving end alongside worker completions and shutdown, so a new
    /// request always wakes it rather than only `Planner::shutdown`.
    wake_tx: Sender<()>,
}

impl RequestQueue {
    fn new(wake_tx: Sender<()>) -> Self {
        RequestQueue { items: Mutex::new(VecDeque::new()), wake_tx }
    }

    fn push(&self, job: Job) {
        self.items.lock().unwrap().push_back(job);
        // Bounded(1) and best-effort: a pending-but-unconsumed wake already
        // covers this push, so a full channel is not an error.
        let _ = self.wake_tx.try_send(());
    }

    /// Drains up to `window` jobs, oldest first.
    fn drain(&self, window: usize) -> Vec<Job> {
        let mut items = self.items.lock().unwrap();
        let n = items.len().min(window);
        items.drain(..n).collect()
    }

    /// Puts jobs a scheduler declined to touch back at the front, preserving order.
    fn return_to_front(&self, jobs: Vec<Job>) {
        let mut items = self.items.lock().unwrap();
        for job in jobs.into_iter().rev() {
            items.push_front(job);
        }
    }

    fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

struct FinishedRecords {
    slots: Mutex<Vec<Option<Job>>>,
    cv: Condvar,
}

impl FinishedRecords {
    fn new() -> Self {
        FinishedRecords { slots: Mutex::new((0..NUM_FINISHED_RECORDS).map(|_| None).collect()), cv: Condvar::new() }
    }

    fn record(&self, job: Job) {
        let mut slots = self.slots.lock().unwrap();
        let idx = (job.job_id as usize) % NUM_FINISHED_RECORDS;
        slots[idx] = Some(job);
        drop(slots);
        self.cv.notify_all();
    }

    /// Blocks until `job_id` shows up as finished in its slot, then returns a clone.
    fn wait_for(&self, job_id: u64) -> Job {
        let idx = (job_id as usize) % NUM_FINISHED_RECORDS;
        let slots = self.slots.lock().unwrap();
        let slots = self
            .cv
            .wait_while(slots, |slots| !matches!(&slots[idx], Some(job) if job.job_id == job_id))
            .unwrap();
        slots[idx].clone().expect("validated present by wait_while predicate")
    }

    fn peek(&self, job_id: u64) -> Option<Job> {
        let idx = (job_id as usize) % NUM_FINISHED_RECORDS;
        let slots = self.slots.lock().unwrap();
        match &slots[idx] {
            Some(job) if job.job_id == job_id => Some(job.clone()),
            _ => None,
        }
    }
}

/// The planner's view of one registered worker: its handle plus the
/// accelerator kind it's bound to, consulted by device-targeted schedulers
/// (`Offloading`) without requiring a downcast through the handle trait.
struct RegisteredWorker {
    handle: Arc<dyn WorkerHandle>,
    device: crate::job::DeviceId,
}

/// Owns the request queue, the scheduler registry, and the finished-job
/// ring; runs the scheduling loop on a dedicated thread.
pub struct Planner {
    queue: RequestQueue,
    finished: FinishedRecords,
    next_job_id: Mutex<u64>,
    schedulers: Vec<(SchedulerId, Box<dyn Scheduler>)>,
    workers: Vec<RegisteredWorker>,
    model_device_map: Mutex<HashMap<usize, WorkerId>>,
    catalog: SubgraphCatalog,
    models: Mutex<ModelManager>,
    tensors: TensorRingBuffer,
    schedule_window_size: usize,
    wake_rx: Receiver<()>,
    kill_tx: Sender<()>,
    kill_rx: Receiver<()>,
    job_log: Option<JobLogWriter>,
}

impl Planner {
    pub fn new(
        scheduler_ids: &[SchedulerId],
        workers: Vec<(Arc<dyn WorkerHandle>, crate::job::DeviceId)>,
        catalog: SubgraphCatalog,
        models: ModelManager,
        tensors: TensorRingBuffer,
        schedule_window_size: usize,
        job_log: Option<JobLogWriter>,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let (kill_tx, kill_rx) = crossbeam_channel::unbounded();
        Arc::new(Planner {
            queue: RequestQueue::new(wake_tx),
            finished: FinishedRecords::new(),
            next_job_id: Mutex::new(1),
            schedulers: scheduler_ids.iter().map(|&id| (id, crate::scheduler::build_scheduler(id))).collect(),
            workers: workers.into_iter().map(|(handle, device)| RegisteredWorker { handle, device }).collect(),
            model_device_map: Mutex::new(HashMap::new()),
            catalog,
            models: Mutex::new(models),
            tensors,
            schedule_window_size: schedule_window_size.max(1),
            wake_rx,
            kill_tx,
            kill_rx,
            job_log,
        })
    }

    /// The shared cost-model store. Workers run on their own threads and
    /// update models directly as jobs complete (`DeviceQueueWorker::execute_one`);
    /// the embedder passes this same mutex to every worker's `run` loop so
    /// those updates feed back into the predictions the planner's next tick
    /// reads, closing the online-model loop described in §4.D/§9.
    pub fn models(&self) -> &Mutex<ModelManager> {
        &self.models
    }

    /// The catalog this planner was built with, for embedders that spawn
    /// worker run loops outside the planner and need the same catalog reference.
    pub fn catalog(&self) -> &SubgraphCatalog {
        &self.catalog
    }

    /// The tensor ring buffer this planner was built with; the embedder
    /// stages request input tensors here before `enqueue_request` and reads
    /// results back out of it once `wait` returns.
    pub fn tensors(&self) -> &TensorRingBuffer {
        &self.tensors
    }

    /// Registers a static `model_id -> worker_id` placement for schedulers
    /// that need one (`FixedDevice`/`FixedDeviceGlobalQueue`).
    pub fn set_fixed_placement(&self, model_id: usize, worker_id: WorkerId) {
        self.model_device_map.lock().unwrap().insert(model_id, worker_id);
    }

    /// Assigns a job id, stamps `enqueue_time`, and appends it to the global
    /// queue. The returned id remains valid to pass to `wait`/`finished_job`
    /// even after the job has scrolled out of the finished-records ring,
    /// as long as the caller calls `wait` before `NUM_FINISHED_RECORDS` more
    /// jobs have finished.
    pub fn enqueue_request(&self, mut job: Job) -> u64 {
        let job_id = {
            let mut next = self.next_job_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        job.job_id = job_id;
        job.enqueue_time = Some(Instant::now());
        self.queue.push(job);
        job_id
    }

    pub fn enqueue_batch(&self, jobs: Vec<Job>) -> Vec<u64> {
        jobs.into_iter().map(|job| self.enqueue_request(job)).collect()
    }

    /// Blocks until `job_id` has finished, returning its terminal record.
    pub fn wait(&self, job_id: u64) -> Job {
        self.finished.wait_for(job_id)
    }

    pub fn wait_all(&self, job_ids: &[u64]) -> Vec<Job> {
        job_ids.iter().map(|&id| self.wait(id)).collect()
    }

    /// Non-blocking check: `Some(job)` if `job_id` has already finished.
    pub fn finished_job(&self, job_id: u64) -> Option<Job> {
        self.finished.peek(job_id)
    }

    /// Spawns the scheduling loop on its own thread, pinned per `cpu_set`.
    pub fn spawn(self: &Arc<Self>, cpu_set: crate::worker::CpuSet, finished_rx: Receiver<Job>) -> JoinHandle<()> {
        let planner = Arc::clone(self);
        std::thread::Builder::new()
            .name("planner".into())
            .spawn(move || planner.run(cpu_set, finished_rx))
            .expect("failed to spawn planner thread")
    }

    fn run(self: &Arc<Self>, cpu_set: crate::worker::CpuSet, finished_rx: Receiver<Job>) {
        cpu_set.pin_current_thread();
        loop {
            self.drain_finished(&finished_rx);
            if self.tick() {
                // Nothing placed and nothing waiting to place: sleep for the
                // next enqueue, the next worker completion, or shutdown,
                // whichever comes first.
                if self.sleep_until_woken(&finished_rx) {
                    return;
                }
            }
            self.drain_finished(&finished_rx);
        }
    }

    /// Blocks on whichever fires first: a worker reporting a finished job, a
    /// new request being enqueued, or `shutdown`. A finished job observed
    /// here is handled immediately rather than deferred to the next
    /// `drain_finished` pass, since going back to sleep would otherwise lose
    /// it until unrelated activity wakes the loop again. Returns `true` once
    /// shut down.
    fn sleep_until_woken(&self, finished_rx: &Receiver<Job>) -> bool {
        let mut select = Select::new();
        let finished_idx = select.recv(finished_rx);
        let wake_idx = select.recv(&self.wake_rx);
        let kill_idx = select.recv(&self.kill_rx);
        let op = select.select();
        match op.index() {
            i if i == finished_idx => {
                if let Ok(job) = op.recv(finished_rx) {
                    self.handle_finished(job);
                }
                false
            }
            i if i == wake_idx => {
                let _ = op.recv(&self.wake_rx);
                false
            }
            i if i == kill_idx => {
                let _ = op.recv(&self.kill_rx);
                true
            }
            _ => unreachable!("Select only registered three receivers"),
        }
    }

    /// Drains any jobs workers have reported finished into the records ring,
    /// chaining continuation subgraphs back onto the local queue.
    fn drain_finished(&self, finished_rx: &Receiver<Job>) {
        while let Ok(job) = finished_rx.try_recv() {
            self.handle_finished(job);
        }
    }

    fn handle_finished(&self, job: Job) {
        if job.status == JobStatus::Success {
            if let Some(subgraph_idx) = job.subgraph_idx {
                if let Some(next_idx) = self.catalog.get(subgraph_idx).next {
                    let mut continuation = job.clone();
                    continuation.subgraph_idx = Some(next_idx);
                    continuation.worker_id = Some(self.catalog.get(next_idx).worker_id);
                    continuation.status = JobStatus::Queued;
                    continuation.invoke_time = None;
                    continuation.end_time = None;
                    self.queue.push(continuation);
                    self.finish(job);
                    return;
                }
            }
        }
        self.finish(job);
    }

    /// Records `job` into the finished-job ring and, if a job log was
    /// configured, appends its TSV row (§6's "Persisted state").
    fn finish(&self, job: Job) {
        if let Some(log) = &self.job_log {
            let device = job
                .worker_id
                .and_then(|wid| self.workers.iter().find(|w| w.handle.id() == wid))
                .map(|w| w.device)
                .unwrap_or(crate::job::DeviceId::Cpu);
            let is_final_subgraph = job.subgraph_idx.map_or(true, |idx| self.catalog.get(idx).next.is_none());
            let sched_id = job.placed_by.unwrap_or(SchedulerId::FixedDevice);
            if let Err(err) = log.write_job(sched_id, &job.model_name, device, &job, is_final_subgraph) {
                tracing::warn!(%err, "failed to append job log row");
            }
        }
        self.finished.record(job);
    }

    /// One pass over the local queue through every scheduler in priority
    /// order. Returns `true` if the queue was empty and nothing was placed,
    /// signalling the caller it's safe to sleep.
    fn tick(&self) -> bool {
        if self.queue.is_empty() {
            return true;
        }
        let mut local = self.queue.drain(self.schedule_window_size);
        if local.is_empty() {
            return true;
        }
        let now = Instant::now();
        let mut expired_jobs = Vec::new();
        local.retain(|job| {
            if job.slo_expired(now) {
                let mut expired = job.clone();
                expired.status = JobStatus::SloViolation;
                expired.end_time = Some(now);
                expired_jobs.push(expired);
                false
            } else {
                true
            }
        });
        for expired in expired_jobs {
            self.finish(expired);
        }

        let model_device_map = self.model_device_map.lock().unwrap().clone();
        let handles: Vec<Arc<dyn WorkerHandle>> = self.workers.iter().map(|w| Arc::clone(&w.handle)).collect();
        let device_of = |worker_id: WorkerId| {
            self.workers
                .iter()
                .find(|w| w.handle.id() == worker_id)
                .map(|w| w.device)
                .unwrap_or(crate::job::DeviceId::Cpu)
        };
        let models = self.models.lock().unwrap();
        let ctx = ScheduleContext {
            catalog: &self.catalog,
            models: &models,
            workers: &handles,
            device_of: &device_of,
            model_device_map: &model_device_map,
            now,
        };

        let mut placed_any = false;
        for (sched_id, scheduler) in &self.schedulers {
            let action = scheduler.schedule(&mut local, &ctx);
            for violation in action.slo_violations {
                self.finish(violation);
            }
            for placement in action.placements {
                placed_any = true;
                if let Some(handle) = handles.iter().find(|w| w.id() == placement.worker_id) {
                    let mut job = placement.job;
                    job.worker_id = Some(placement.worker_id);
                    job.subgraph_idx = Some(placement.subgraph_idx);
                    job.placed_by = Some(*sched_id);
                    if !handle.give_job(job.clone(), placement.subgraph_idx) {
                        local.push(job);
                    }
                } else {
                    local.push(placement.job);
                }
            }
            if local.is_empty() {
                break;
            }
        }
        drop(models);

        if !local.is_empty() {
            self.queue.return_to_front(local);
        }
        !placed_any
    }

    pub fn shutdown(&self) {
        let _ = self.kill_tx.send(());
    }
}
