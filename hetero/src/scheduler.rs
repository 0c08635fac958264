//! Pluggable scheduling policies.
//!
//! Each policy is a pure function over a snapshot of the local queue plus
//! read access to the catalog, cost models, and resource monitor — the
//! single `Scheduler` capability Design Note §9 calls for, replacing a deep
//! class hierarchy with one trait and a registry keyed by [`SchedulerId`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::catalog::SubgraphCatalog;
use crate::job::{DeviceId, Job, SchedulerId, SubgraphIdx, WorkerId};
use crate::models::ModelManager;
use crate::worker::WorkerHandle;

/// What a scheduler needs from the planner before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    DeviceQueue,
    GlobalQueue,
}

/// One assignment: a job placed on a specific worker's specific subgraph.
pub struct Placement {
    pub worker_id: WorkerId,
    pub job: Job,
    pub subgraph_idx: SubgraphIdx,
}

/// What a scheduling pass produced: placements to dispatch plus jobs left
/// in the local queue (skipped, or failed their SLO outright).
#[derive(Default)]
pub struct ScheduleAction {
    pub placements: Vec<Placement>,
    /// Jobs finished immediately with `slo_violation` rather than dispatched.
    pub slo_violations: Vec<Job>,
}

/// Context a scheduler reads from; never mutated by the scheduler itself.
pub struct ScheduleContext<'a> {
    pub catalog: &'a SubgraphCatalog,
    pub models: &'a ModelManager,
    pub workers: &'a [std::sync::Arc<dyn WorkerHandle>],
    pub device_of: &'a dyn Fn(WorkerId) -> DeviceId,
    /// Static placement table consulted by `FixedDevice`/`FixedDeviceGlobalQueue`.
    pub model_device_map: &'a HashMap<usize, WorkerId>,
    pub now: Instant,
}

pub trait Scheduler: Send + Sync {
    fn need_profile(&self) -> bool;
    fn need_fallback_subgraphs(&self) -> bool;
    fn worker_type(&self) -> WorkerKind;
    /// Consumes as much of `local` as it can place this tick; jobs it
    /// declines to touch are left in `local` for the next scheduler in
    /// priority order (or the next planner tick) to consider. Never
    /// reorders the jobs it does dispatch to any one worker.
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction;
}

fn worker_idle(ctx: &ScheduleContext, worker_id: WorkerId) -> bool {
    ctx.workers.iter().find(|w| w.id() == worker_id).map(|w| w.waiting_time(ctx.models, ctx.catalog).is_zero()).unwrap_or(false)
}

fn expected_latency(ctx: &ScheduleContext, worker_id: WorkerId, subgraph_idx: SubgraphIdx) -> Duration {
    ctx.models.predicted_latency(worker_id, ctx.catalog.get(subgraph_idx))
}

fn worker_waiting(ctx: &ScheduleContext, worker_id: WorkerId) -> Duration {
    ctx.workers.iter().find(|w| w.id() == worker_id).map(|w| w.waiting_time(ctx.models, ctx.catalog)).unwrap_or(Duration::ZERO)
}

/// §4.F SLO handling: a job is dropped as an immediate `slo_violation`
/// when even the earliest possible dispatch (now) plus `candidate_latency`
/// would blow its deadline.
fn slo_already_unattainable(job: &Job, ctx: &ScheduleContext, candidate_latency: Duration) -> bool {
    match job.slack(ctx.now) {
        Some(slack) => slack < candidate_latency,
        None => false,
    }
}

/// Route each job to `model_device_map[model_id]`, or `job`'s own
/// previously-set `worker_id` if present.
pub struct FixedDevice;
impl Scheduler for FixedDevice {
    fn need_profile(&self) -> bool {
        false
    }
    fn need_fallback_subgraphs(&self) -> bool {
        false
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in local.drain(..) {
            let worker_id = job.worker_id.or_else(|| ctx.model_device_map.get(&job.model_id).copied());
            match worker_id.and_then(|w| ctx.catalog.subgraph_idx(job.model_id, w).map(|sg| (w, sg))) {
                Some((worker_id, subgraph_idx)) => action.placements.push(Placement { worker_id, job, subgraph_idx }),
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// `FixedDevice`, but only dispatches when the target worker is idle; drops
/// jobs whose SLO is already unattainable. Open Question (a): the original
/// scheduler's reference body is mostly commented-out pseudocode after an
/// early "not implemented" bail-out — this implements that commented logic
/// as the real, active behavior.
pub struct FixedDeviceGlobalQueue;
impl Scheduler for FixedDeviceGlobalQueue {
    fn need_profile(&self) -> bool {
        false
    }
    fn need_fallback_subgraphs(&self) -> bool {
        false
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::GlobalQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in local.drain(..) {
            let Some(worker_id) = job.worker_id.or_else(|| ctx.model_device_map.get(&job.model_id).copied()) else {
                remaining.push(job);
                continue;
            };
            let Some(subgraph_idx) = ctx.catalog.subgraph_idx(job.model_id, worker_id) else {
                remaining.push(job);
                continue;
            };
            if slo_already_unattainable(&job, ctx, expected_latency(ctx, worker_id, subgraph_idx)) {
                let mut dropped = job;
                dropped.status = crate::job::JobStatus::SloViolation;
                dropped.end_time = Some(ctx.now);
                action.slo_violations.push(dropped);
                continue;
            }
            if worker_idle(ctx, worker_id) {
                action.placements.push(Placement { worker_id, job, subgraph_idx });
            } else {
                remaining.push(job);
            }
        }
        *local = remaining;
        action
    }
}

/// For each idle worker, pick the first queued job it can run.
pub struct RoundRobin;
impl Scheduler for RoundRobin {
    fn need_profile(&self) -> bool {
        false
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut placed_indices = HashSet::new();
        for worker in ctx.workers {
            if !worker_idle(ctx, worker.id()) {
                continue;
            }
            if let Some((i, job, subgraph_idx)) = local.iter().enumerate().find_map(|(i, job)| {
                if placed_indices.contains(&i) {
                    return None;
                }
                ctx.catalog.subgraph_idx(job.model_id, worker.id()).map(|sg| (i, job.clone(), sg))
            }) {
                placed_indices.insert(i);
                action.placements.push(Placement { worker_id: worker.id(), job, subgraph_idx });
            }
        }
        *local = local
            .drain(..)
            .enumerate()
            .filter_map(|(i, job)| (!placed_indices.contains(&i)).then_some(job))
            .collect();
        action
    }
}

/// Minimizes `max(now, worker_waiting) + predicted_latency`, following
/// continuation subgraphs with a recursive look-ahead so a multi-subgraph
/// model's total finish time (not just its first hop) drives placement.
pub struct ShortestExpectedLatency;
impl ShortestExpectedLatency {
    /// Sum of predicted latencies along the continuation chain starting at `subgraph_idx`.
    fn chain_latency(ctx: &ScheduleContext, worker_id: WorkerId, subgraph_idx: SubgraphIdx) -> Duration {
        let mut total = expected_latency(ctx, worker_id, subgraph_idx);
        let mut next = ctx.catalog.get(subgraph_idx).next;
        while let Some(idx) = next {
            let sg = ctx.catalog.get(idx);
            total += expected_latency(ctx, sg.worker_id, idx);
            next = sg.next;
        }
        total
    }

    fn best_worker(ctx: &ScheduleContext, job: &Job) -> Option<(WorkerId, SubgraphIdx, Duration)> {
        ctx.workers
            .iter()
            .filter_map(|w| {
                let subgraph_idx = ctx.catalog.subgraph_candidates(job.model_id, 0).into_iter().find(|&idx| ctx.catalog.get(idx).worker_id == w.id())?;
                let finish = worker_waiting(ctx, w.id()).max(Duration::ZERO) + Self::chain_latency(ctx, w.id(), subgraph_idx);
                Some((w.id(), subgraph_idx, finish))
            })
            .min_by_key(|&(_, _, finish)| finish)
    }
}
impl Scheduler for ShortestExpectedLatency {
    fn need_profile(&self) -> bool {
        true
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in local.drain(..) {
            match Self::best_worker(ctx, &job) {
                Some((worker_id, subgraph_idx, _)) => action.placements.push(Placement { worker_id, job, subgraph_idx }),
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// `ShortestExpectedLatency` with a stable per-tick view of worker waiting
/// times and a yield set, so a job that would contend for the same
/// currently-busy best choice as an earlier job this tick yields instead of
/// live-locking the loop on one popular worker (§11 supplement).
pub struct Heft {
    reserve: ReserveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReserveMode {
    None,
    SloOnly,
    All,
}

impl Heft {
    pub fn new() -> Self {
        Heft { reserve: ReserveMode::None }
    }
}

impl Scheduler for Heft {
    fn need_profile(&self) -> bool {
        true
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        // `reserved` tracks additional latency this tick's earlier placements
        // have already committed a worker to, so later jobs in the same tick
        // see a consistent, updated waiting-time view rather than racing
        // against a tick-stale snapshot.
        let mut reserved: HashMap<WorkerId, Duration> = HashMap::new();
        let mut yielded = HashSet::new();
        for job in local.drain(..) {
            let slo_bearing = job.slo_us > 0;
            let best = ctx
                .workers
                .iter()
                .filter_map(|w| {
                    let subgraph_idx = ctx.catalog.subgraph_candidates(job.model_id, 0).into_iter().find(|&idx| ctx.catalog.get(idx).worker_id == w.id())?;
                    let base_wait = worker_waiting(ctx, w.id()) + *reserved.get(&w.id()).unwrap_or(&Duration::ZERO);
                    let finish = base_wait + ShortestExpectedLatency::chain_latency(ctx, w.id(), subgraph_idx);
                    Some((w.id(), subgraph_idx, finish))
                })
                .min_by_key(|&(_, _, finish)| finish);
            match best {
                Some((worker_id, subgraph_idx, _)) if !yielded.contains(&worker_id) => {
                    let should_reserve = matches!(self.reserve, ReserveMode::All) || (matches!(self.reserve, ReserveMode::SloOnly) && slo_bearing);
                    if should_reserve {
                        *reserved.entry(worker_id).or_insert(Duration::ZERO) += expected_latency(ctx, worker_id, subgraph_idx);
                    } else {
                        yielded.insert(worker_id);
                    }
                    action.placements.push(Placement { worker_id, job, subgraph_idx });
                }
                _ => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// `Heft` that always reserves future subgraph slots, so later jobs in the
/// same tick (and the next) account for this tick's placements.
pub struct HeftReserved {
    inner: Heft,
}
impl HeftReserved {
    /// `reserve_all = true` matches the "reserve-all" variant (reserves for
    /// every job); `false` reserves only for SLO-bearing jobs.
    pub fn new(reserve_all: bool) -> Self {
        HeftReserved { inner: Heft { reserve: if reserve_all { ReserveMode::All } else { ReserveMode::SloOnly } } }
    }
}
impl Scheduler for HeftReserved {
    fn need_profile(&self) -> bool {
        true
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        self.inner.schedule(local, ctx)
    }
}

/// Sorts by `deadline - now - remaining_predicted_latency` ascending —
/// jobs closest to blowing their SLO go first.
pub struct LeastSlackFirst;
impl Scheduler for LeastSlackFirst {
    fn need_profile(&self) -> bool {
        true
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut jobs: Vec<Job> = local.drain(..).collect();
        jobs.sort_by_key(|job| {
            let remaining = ShortestExpectedLatency::best_worker(ctx, job).map_or(Duration::ZERO, |(_, _, f)| f);
            job.slack(ctx.now).map(|s| s.saturating_sub(remaining)).unwrap_or(Duration::MAX)
        });
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in jobs {
            match ShortestExpectedLatency::best_worker(ctx, &job) {
                Some((worker_id, subgraph_idx, latency)) if !slo_already_unattainable(&job, ctx, latency) => {
                    action.placements.push(Placement { worker_id, job, subgraph_idx })
                }
                Some(_) => {
                    let mut dropped = job;
                    dropped.status = crate::job::JobStatus::SloViolation;
                    dropped.end_time = Some(ctx.now);
                    action.slo_violations.push(dropped);
                }
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// Picks the worker whose predicted post-invoke temperature stays lowest
/// under its threshold; falls back to the minimum-throttled-latency worker
/// if no candidate is thermally safe.
pub struct ThermalAware;
impl Scheduler for ThermalAware {
    fn need_profile(&self) -> bool {
        true
    }
    fn need_fallback_subgraphs(&self) -> bool {
        true
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in local.drain(..) {
            let candidates: Vec<(WorkerId, SubgraphIdx)> = ctx
                .catalog
                .subgraph_candidates(job.model_id, 0)
                .into_iter()
                .map(|idx| (ctx.catalog.get(idx).worker_id, idx))
                .collect();
            let safe = candidates.iter().filter(|&&(w, sg)| ctx.models.possible_workers(ctx.catalog.get(sg)).contains(&w)).min_by(|&&(_, a), &&(_, b)| {
                let ta = ctx.models.predicted_temperature(ctx.catalog.get(a).worker_id, ctx.catalog.get(a)).into_iter().fold(f64::MIN, f64::max);
                let tb = ctx.models.predicted_temperature(ctx.catalog.get(b).worker_id, ctx.catalog.get(b)).into_iter().fold(f64::MIN, f64::max);
                ta.total_cmp(&tb)
            });
            let chosen = safe.copied().or_else(|| {
                candidates.iter().copied().min_by_key(|&(w, sg)| expected_latency(ctx, w, sg))
            });
            match chosen {
                Some((worker_id, subgraph_idx)) => action.placements.push(Placement { worker_id, job, subgraph_idx }),
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// Routes everything to the cloud worker.
pub struct Offloading;
impl Scheduler for Offloading {
    fn need_profile(&self) -> bool {
        false
    }
    fn need_fallback_subgraphs(&self) -> bool {
        false
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        for job in local.drain(..) {
            let cloud = ctx.workers.iter().find(|w| (ctx.device_of)(w.id()) == DeviceId::Cloud);
            match cloud.and_then(|w| ctx.catalog.subgraph_idx(job.model_id, w.id()).map(|sg| (w.id(), sg))) {
                Some((worker_id, subgraph_idx)) => action.placements.push(Placement { worker_id, job, subgraph_idx }),
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// Uniform over currently-idle workers that have a valid subgraph for the job.
pub struct RandomAssign;
impl Scheduler for RandomAssign {
    fn need_profile(&self) -> bool {
        false
    }
    fn need_fallback_subgraphs(&self) -> bool {
        false
    }
    fn worker_type(&self) -> WorkerKind {
        WorkerKind::DeviceQueue
    }
    fn schedule(&self, local: &mut Vec<Job>, ctx: &ScheduleContext) -> ScheduleAction {
        let mut action = ScheduleAction::default();
        let mut remaining = Vec::new();
        let mut rng = rand::thread_rng();
        for job in local.drain(..) {
            let mut candidates: Vec<(WorkerId, SubgraphIdx)> = ctx
                .workers
                .iter()
                .filter(|w| worker_idle(ctx, w.id()))
                .filter_map(|w| ctx.catalog.subgraph_idx(job.model_id, w.id()).map(|sg| (w.id(), sg)))
                .collect();
            candidates.shuffle(&mut rng);
            match candidates.pop() {
                Some((worker_id, subgraph_idx)) => action.placements.push(Placement { worker_id, job, subgraph_idx }),
                None => remaining.push(job),
            }
        }
        *local = remaining;
        action
    }
}

/// Registry mapping a dense [`SchedulerId`] to its policy instance.
pub fn build_scheduler(id: SchedulerId) -> Box<dyn Scheduler> {
    match id {
        SchedulerId::FixedDevice => Box::new(FixedDevice),
        SchedulerId::RoundRobin => Box::new(RoundRobin),
        SchedulerId::ShortestExpectedLatency => Box::new(ShortestExpectedLatency),
        SchedulerId::FixedDeviceGlobalQueue => Box::new(FixedDeviceGlobalQueue),
        SchedulerId::Heft => Box::new(Heft::new()),
        SchedulerId::HeftReserved => Box::new(HeftReserved::new(false)),
        SchedulerId::LeastSlackFirst => Box::new(LeastSlackFirst),
        SchedulerId::ThermalAware => Box::new(ThermalAware),
        SchedulerId::Offloading => Box::new(Offloading),
        SchedulerId::RandomAssign => Box::new(RandomAssign),
    }
}
