//! Online cost models: per-worker latency and thermal prediction, refit as
//! jobs complete.
//!
//! Latency uses an EWMA on local workers and an EWMA-plus-regression split
//! (computation vs. communication time) on the cloud worker. Thermal uses a
//! closed-form linear regression, one model per thermal zone a worker's
//! placement decision needs to respect. Both regressions solve the normal
//! equation `(XᵀX)⁻¹Xᵀy` directly rather than depending on a linear-algebra
//! crate — the matrices here never exceed a handful of rows.

use std::collections::HashMap;
use std::time::Duration;

use crate::catalog::Subgraph;
use crate::job::{DeviceId, Job, WorkerId};
use crate::resource::ResourceMonitor;

/// EWMA smoothing factor applied to every `LatencyModel` update, matching
/// the runtime's configurable `profile_smoothing_factor` default.
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.1;
/// Minimum observations before the cloud communication regression is trusted.
const MIN_COMM_OBSERVATIONS: usize = 30;
/// Floor applied to predicted communication time below `MIN_COMM_OBSERVATIONS`.
const COMM_FLOOR: Duration = Duration::from_millis(2);
/// Sliding-window size for the cloud communication-time regression.
const LATENCY_WINDOW: usize = 100;
/// Minimum samples before a thermal regression is fit; below this, predict returns the current reading.
const MIN_THERMAL_LOG_SIZE: usize = 50;

/// A tiny dense matrix solver for the normal equation, specialized to the
/// small fixed feature counts used here (never more than 5 columns).
mod linalg {
    /// Solves `(XtX) beta = Xty` via Gauss-Jordan elimination with partial
    /// pivoting. Returns `None` if `XtX` is (numerically) singular.
    pub fn solve(mut xtx: Vec<Vec<f64>>, mut xty: Vec<f64>) -> Option<Vec<f64>> {
        let n = xty.len();
        for col in 0..n {
            // Partial pivot.
            let pivot = (col..n).max_by(|&a, &b| xtx[a][col].abs().total_cmp(&xtx[b][col].abs()))?;
            if xtx[pivot][col].abs() < 1e-12 {
                return None;
            }
            xtx.swap(col, pivot);
            xty.swap(col, pivot);

            let diag = xtx[col][col];
            for j in 0..n {
                xtx[col][j] /= diag;
            }
            xty[col] /= diag;

            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = xtx[row][col];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    xtx[row][j] -= factor * xtx[col][j];
                }
                xty[row] -= factor * xty[col];
            }
        }
        Some(xty)
    }

    /// Builds `XtX` and `Xty` from row-major feature rows and matching targets.
    pub fn normal_equations(rows: &[Vec<f64>], targets: &[f64]) -> (Vec<Vec<f64>>, Vec<f64>) {
        let n = rows.first().map_or(0, |r| r.len());
        let mut xtx = vec![vec![0.0; n]; n];
        let mut xty = vec![0.0; n];
        for (row, &target) in rows.iter().zip(targets) {
            for i in 0..n {
                xty[i] += row[i] * target;
                for j in 0..n {
                    xtx[i][j] += row[i] * row[j];
                }
            }
        }
        (xtx, xty)
    }
}

/// A sliding window of `(features, target)` rows, reused modulo its capacity.
#[derive(Debug, Clone, Default)]
struct SlidingLog {
    capacity: usize,
    rows: Vec<Vec<f64>>,
    targets: Vec<f64>,
    next_slot: usize,
}

impl SlidingLog {
    fn new(capacity: usize) -> Self {
        SlidingLog { capacity, rows: Vec::new(), targets: Vec::new(), next_slot: 0 }
    }

    fn push(&mut self, features: Vec<f64>, target: f64) {
        if self.rows.len() < self.capacity {
            self.rows.push(features);
            self.targets.push(target);
        } else {
            self.rows[self.next_slot] = features;
            self.targets[self.next_slot] = target;
            self.next_slot = (self.next_slot + 1) % self.capacity;
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn fit(&self) -> Option<Vec<f64>> {
        if self.rows.is_empty() {
            return None;
        }
        let (xtx, xty) = linalg::normal_equations(&self.rows, &self.targets);
        linalg::solve(xtx, xty)
    }
}

fn dot(coeffs: &[f64], features: &[f64]) -> f64 {
    coeffs.iter().zip(features).map(|(c, f)| c * f).sum()
}

/// Per-model EWMA latency estimate, used directly by local (non-cloud) workers.
#[derive(Debug, Default)]
struct LocalLatencyModel {
    smoothing_factor: f64,
    ewma_us: HashMap<usize, f64>,
}

impl LocalLatencyModel {
    fn new(smoothing_factor: f64) -> Self {
        LocalLatencyModel { smoothing_factor, ewma_us: HashMap::new() }
    }

    fn predict(&self, model_id: usize) -> Duration {
        Duration::from_micros(self.ewma_us.get(&model_id).copied().unwrap_or(0.0) as u64)
    }

    fn update(&mut self, model_id: usize, observed: Duration) {
        let observed_us = observed.as_micros() as f64;
        let entry = self.ewma_us.entry(model_id).or_insert(observed_us);
        *entry = self.smoothing_factor * observed_us + (1.0 - self.smoothing_factor) * *entry;
    }
}

/// Cloud-worker latency: per-model computation EWMA plus a regression over
/// `[input_bytes, output_bytes, 1] -> comm_time_us` fitted on the last
/// [`LATENCY_WINDOW`] observations.
#[derive(Debug)]
struct CloudLatencyModel {
    computation_ewma_us: HashMap<usize, f64>,
    smoothing_factor: f64,
    comm_log: SlidingLog,
}

impl CloudLatencyModel {
    fn new(smoothing_factor: f64) -> Self {
        CloudLatencyModel {
            computation_ewma_us: HashMap::new(),
            smoothing_factor,
            comm_log: SlidingLog::new(LATENCY_WINDOW),
        }
    }

    fn predict(&self, model_id: usize, input_bytes: usize, output_bytes: usize) -> Duration {
        let computation = self.computation_ewma_us.get(&model_id).copied().unwrap_or(0.0);
        let comm_us = if self.comm_log.len() < MIN_COMM_OBSERVATIONS {
            COMM_FLOOR.as_micros() as f64
        } else {
            match self.comm_log.fit() {
                Some(coeffs) => dot(&coeffs, &[input_bytes as f64, output_bytes as f64, 1.0]).max(0.0),
                None => COMM_FLOOR.as_micros() as f64,
            }
        };
        Duration::from_micros((computation + comm_us) as u64)
    }

    fn update(&mut self, model_id: usize, input_bytes: usize, output_bytes: usize, computation_time: Duration, comm_time: Duration) {
        let computation_us = computation_time.as_micros() as f64;
        let entry = self.computation_ewma_us.entry(model_id).or_insert(computation_us);
        *entry = self.smoothing_factor * computation_us + (1.0 - self.smoothing_factor) * *entry;
        self.comm_log.push(vec![input_bytes as f64, output_bytes as f64, 1.0], comm_time.as_micros() as f64);
    }
}

/// Uniform latency-prediction surface (Open Question (b)): both local and
/// cloud variants are driven through this one trait.
pub trait LatencyModel: Send + Sync {
    fn predict(&self, subgraph: &Subgraph) -> Duration;
    fn update(&mut self, job: &Job, subgraph: &Subgraph);
    /// Allows `ModelManager::update_cloud_latency` to recover the concrete
    /// cloud variant without widening this trait's safe surface further.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

struct LocalLatencyAdapter(LocalLatencyModel);
impl LatencyModel for LocalLatencyAdapter {
    fn predict(&self, subgraph: &Subgraph) -> Duration {
        self.0.predict(subgraph.model_id)
    }
    fn update(&mut self, job: &Job, subgraph: &Subgraph) {
        if let Some(latency) = job.profiled_latency {
            self.0.update(subgraph.model_id, latency);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

struct CloudLatencyAdapter(CloudLatencyModel);
impl LatencyModel for CloudLatencyAdapter {
    fn predict(&self, subgraph: &Subgraph) -> Duration {
        self.0.predict(subgraph.model_id, subgraph.input_bytes, subgraph.output_bytes)
    }
    fn update(&mut self, job: &Job, subgraph: &Subgraph) {
        if let Some(total) = job.profiled_latency {
            // Without a dedicated computation-time channel from the cloud
            // response, attribute the whole observed latency to computation
            // and zero communication; `CloudClient::invoke` in `executor.rs`
            // is expected to call `update_cloud_latency` directly with the
            // split instead, which supersedes this generic path.
            self.0.update(subgraph.model_id, subgraph.input_bytes, subgraph.output_bytes, total, Duration::ZERO);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Thermal regression for one zone, shared shape between local and cloud workers.
#[derive(Debug)]
struct ThermalModel {
    feature_count: usize,
    log: SlidingLog,
}

impl ThermalModel {
    fn new(feature_count: usize) -> Self {
        ThermalModel { feature_count, log: SlidingLog::new(512) }
    }

    fn predict(&self, features: &[f64], current_temp: f64) -> f64 {
        debug_assert_eq!(features.len(), self.feature_count);
        if self.log.len() < MIN_THERMAL_LOG_SIZE {
            return current_temp;
        }
        match self.log.fit() {
            Some(coeffs) => dot(&coeffs, features),
            None => current_temp,
        }
    }

    fn update(&mut self, features: Vec<f64>, temp_after: f64) {
        debug_assert_eq!(features.len(), self.feature_count);
        self.log.push(features, temp_after);
    }
}

/// Local-worker thermal features: `[temp_all.., freq_all.., flops, io_bytes, 1]`.
fn local_thermal_features(temps: &[f64], freqs: &[f64], flops: f64, io_bytes: f64) -> Vec<f64> {
    let mut features = Vec::with_capacity(temps.len() + freqs.len() + 3);
    features.extend_from_slice(temps);
    features.extend_from_slice(freqs);
    features.push(flops);
    features.push(io_bytes);
    features.push(1.0);
    features
}

/// Cloud-worker thermal features: `[input_bytes, output_bytes, rssi, waiting_time_us, 1]`.
fn cloud_thermal_features(input_bytes: f64, output_bytes: f64, rssi: f64, waiting_time_us: f64) -> Vec<f64> {
    vec![input_bytes, output_bytes, rssi, waiting_time_us, 1.0]
}

struct WorkerModels {
    latency: Box<dyn LatencyModel>,
    /// One thermal model per zone this worker's placement decision must respect.
    thermal: Vec<ThermalModel>,
    is_cloud: bool,
}

/// One [`LatencyModel`] and one [`ThermalModel`]-per-zone per worker, the
/// single point of contact between workers/planner and online cost prediction.
pub struct ModelManager {
    workers: HashMap<WorkerId, WorkerModels>,
    resource_monitor: std::sync::Arc<ResourceMonitor>,
}

impl ModelManager {
    pub fn new(resource_monitor: std::sync::Arc<ResourceMonitor>) -> Self {
        ModelManager { workers: HashMap::new(), resource_monitor }
    }

    /// Registers a worker's cost models. `thermal_zone_count` is the number
    /// of zones (own + any target zones) this worker's placement decisions
    /// must respect; local workers get a feature vector sized from
    /// `cpu_count` (temps) + `cpu_count` (freqs) + 3, cloud workers get the
    /// fixed 5-feature vector.
    pub fn register_worker(&mut self, worker_id: WorkerId, device: DeviceId, thermal_zone_count: usize, cpu_count: usize) {
        let is_cloud = device == DeviceId::Cloud;
        let latency: Box<dyn LatencyModel> = if is_cloud {
            Box::new(CloudLatencyAdapter(CloudLatencyModel::new(DEFAULT_SMOOTHING_FACTOR)))
        } else {
            Box::new(LocalLatencyAdapter(LocalLatencyModel::new(DEFAULT_SMOOTHING_FACTOR)))
        };
        let feature_count = if is_cloud { 5 } else { 2 * cpu_count + 3 };
        let thermal = (0..thermal_zone_count).map(|_| ThermalModel::new(feature_count)).collect();
        self.workers.insert(worker_id, WorkerModels { latency, thermal, is_cloud });
    }

    pub fn predicted_latency(&self, worker: WorkerId, subgraph: &Subgraph) -> Duration {
        self.workers.get(&worker).map_or(Duration::ZERO, |w| w.latency.predict(subgraph))
    }

    /// Predicted post-invoke temperature in each of the worker's zones.
    pub fn predicted_temperature(&self, worker: WorkerId, subgraph: &Subgraph) -> Vec<f64> {
        let Some(w) = self.workers.get(&worker) else { return Vec::new() };
        let temps = self.resource_monitor.all_temperatures();
        let freqs = self.resource_monitor.all_frequencies();
        w.thermal
            .iter()
            .map(|model| {
                let features = if w.is_cloud {
                    cloud_thermal_features(subgraph.input_bytes as f64, subgraph.output_bytes as f64, -1.0, 0.0)
                } else {
                    local_thermal_features(&temps, &freqs, subgraph.flops, (subgraph.input_bytes + subgraph.output_bytes) as f64)
                };
                let current = self.resource_monitor.temperature(worker);
                model.predict(&features, current)
            })
            .collect()
    }

    /// Workers whose predicted temperature, in every zone, stays under that
    /// worker's throttling threshold.
    pub fn possible_workers(&self, subgraph: &Subgraph) -> Vec<WorkerId> {
        self.workers
            .keys()
            .copied()
            .filter(|&worker| {
                let threshold = self.resource_monitor.throttling_threshold(worker);
                self.predicted_temperature(worker, subgraph).iter().all(|&t| t < threshold)
            })
            .collect()
    }

    /// Exposed for diagnostics/tests (§11 supplement): total FLOPs attributed to `subgraph`.
    pub fn flops(&self, subgraph: &Subgraph) -> f64 {
        subgraph.flops
    }

    /// Exposed for diagnostics/tests: total input+output bytes for `subgraph`.
    pub fn membytes(&self, subgraph: &Subgraph) -> usize {
        subgraph.input_bytes + subgraph.output_bytes
    }

    /// Dispatches a completed job's observation to the correct latency and
    /// thermal models for the worker it ran on.
    pub fn update(&mut self, job: &Job, subgraph: &Subgraph) {
        let Some(worker_id) = job.worker_id else { return };
        let Some(w) = self.workers.get_mut(&worker_id) else { return };
        w.latency.update(job, subgraph);
        for (zone, model) in w.thermal.iter_mut().enumerate() {
            let after = job.thermal_after.get(zone).copied().unwrap_or(-1.0);
            if after < 0.0 {
                continue;
            }
            let features = if w.is_cloud {
                cloud_thermal_features(subgraph.input_bytes as f64, subgraph.output_bytes as f64, -1.0, 0.0)
            } else {
                local_thermal_features(&job.thermal_before, &job.frequency_before, subgraph.flops, (subgraph.input_bytes + subgraph.output_bytes) as f64)
            };
            model.update(features, after);
        }
    }

    /// Directly updates the cloud latency model with the computation/comm split
    /// a `CloudClient` round trip yields (§6 wire protocol) rather than going
    /// through the generic `update` path, which cannot see that split.
    pub fn update_cloud_latency(&mut self, worker: WorkerId, subgraph: &Subgraph, computation_time: Duration, comm_time: Duration) {
        if let Some(w) = self.workers.get_mut(&worker) {
            if let Some(cloud) = w.latency.as_any_mut().downcast_mut::<CloudLatencyAdapter>() {
                cloud.0.update(subgraph.model_id, subgraph.input_bytes, subgraph.output_bytes, computation_time, comm_time);
            }
        }
    }
}
