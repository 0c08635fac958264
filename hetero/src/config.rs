//! Deserializable configuration surface (§6).
//!
//! Mirrors `band/config.cc`'s `ParseRuntimeConfigFromJsonObject`: two
//! mandatory keys (`log_path`, `schedulers`), everything else optional with
//! runtime-sensible defaults, worker entries backfilling their per-worker
//! overrides from the top-level interpreter defaults when unset.

use serde::Deserialize;

use crate::error::RuntimeError;
use crate::job::SchedulerId;

fn default_num_threads() -> usize {
    1
}

fn default_smoothing_factor() -> f64 {
    crate::models::DEFAULT_SMOOTHING_FACTOR
}

fn default_copy_computation_ratio() -> f64 {
    0.1
}

fn default_availability_check_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgraphPreparationTypeConfig {
    NoFallback,
    FallbackPerDevice,
    MergeUnit,
}

impl From<SubgraphPreparationTypeConfig> for crate::catalog::SubgraphPreparationType {
    fn from(value: SubgraphPreparationTypeConfig) -> Self {
        match value {
            SubgraphPreparationTypeConfig::NoFallback => crate::catalog::SubgraphPreparationType::NoFallback,
            SubgraphPreparationTypeConfig::FallbackPerDevice => crate::catalog::SubgraphPreparationType::FallbackPerDevice,
            SubgraphPreparationTypeConfig::MergeUnit => crate::catalog::SubgraphPreparationType::MergeUnit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfigEntry {
    pub device: String,
    pub cpu_masks: Option<String>,
    pub num_threads: Option<usize>,
    pub profile_copy_computation_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfigEntry {
    pub device: String,
    pub tz_path: Option<String>,
    pub freq_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub log_path: String,
    pub schedulers: Vec<u8>,

    #[serde(default = "default_cpu_masks")]
    pub cpu_masks: String,
    pub planner_cpu_masks: Option<String>,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default)]
    pub schedule_window_size: Option<usize>,
    #[serde(default = "default_smoothing_factor")]
    pub profile_smoothing_factor: f64,
    pub model_profile: Option<String>,
    #[serde(default)]
    pub profile_online: bool,
    #[serde(default)]
    pub profile_warmup_runs: usize,
    #[serde(default)]
    pub profile_num_runs: usize,
    #[serde(default = "default_copy_computation_ratio")]
    pub profile_copy_computation_ratio: f64,
    pub subgraph_preparation_type: Option<SubgraphPreparationTypeConfig>,
    #[serde(default)]
    pub minimum_subgraph_size: usize,
    #[serde(default)]
    pub workers: Vec<WorkerConfigEntry>,
    #[serde(default)]
    pub allow_work_steal: bool,
    #[serde(default = "default_availability_check_interval_ms")]
    pub availability_check_interval_ms: u64,
    pub offloading_target: Option<String>,
    pub offloading_data_size: Option<usize>,
    #[serde(default)]
    pub resources: Vec<ResourceConfigEntry>,
    pub temperature_log_path: Option<String>,
}

fn default_cpu_masks() -> String {
    "all".to_string()
}

/// Resolved scheduler id list, validated against the dense `SchedulerId` range.
pub fn resolve_scheduler_ids(raw: &[u8]) -> Result<Vec<SchedulerId>, RuntimeError> {
    raw.iter()
        .map(|&id| scheduler_id_from_u8(id))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RuntimeError::ConfigParseError(format!("scheduler id out of range in {raw:?}")))
}

fn scheduler_id_from_u8(id: u8) -> Option<SchedulerId> {
    Some(match id {
        0 => SchedulerId::FixedDevice,
        1 => SchedulerId::RoundRobin,
        2 => SchedulerId::ShortestExpectedLatency,
        3 => SchedulerId::FixedDeviceGlobalQueue,
        4 => SchedulerId::Heft,
        5 => SchedulerId::HeftReserved,
        6 => SchedulerId::LeastSlackFirst,
        7 => SchedulerId::ThermalAware,
        8 => SchedulerId::Offloading,
        9 => SchedulerId::RandomAssign,
        _ => return None,
    })
}

impl RuntimeConfig {
    /// Parses and validates a JSON config, checking the two mandatory keys
    /// and every scheduler id up front rather than deferring validation to
    /// first use.
    pub fn from_json_str(text: &str) -> Result<RuntimeConfig, RuntimeError> {
        let config: RuntimeConfig =
            serde_json::from_str(text).map_err(|e| RuntimeError::ConfigParseError(e.to_string()))?;
        if config.log_path.is_empty() {
            return Err(RuntimeError::ConfigParseError("log_path is required".into()));
        }
        if config.schedulers.is_empty() {
            return Err(RuntimeError::ConfigParseError("schedulers must be non-empty".into()));
        }
        resolve_scheduler_ids(&config.schedulers)?;
        if let Some(window) = config.schedule_window_size {
            if window == 0 {
                return Err(RuntimeError::ConfigParseError("schedule_window_size must be > 0".into()));
            }
        }
        Ok(config)
    }

    /// Parses and validates a JSON config read from any `std::io::Read`
    /// source (a file handle, an embedded resource, a test fixture).
    pub fn from_reader<R: std::io::Read>(mut reader: R) -> Result<RuntimeConfig, RuntimeError> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| RuntimeError::ConfigParseError(e.to_string()))?;
        Self::from_json_str(&text)
    }

    /// The planner thread's affinity mask, defaulting to `cpu_masks` when unset.
    pub fn planner_cpu_masks(&self) -> &str {
        self.planner_cpu_masks.as_deref().unwrap_or(&self.cpu_masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_schedulers() {
        let json = r#"{"log_path": "/tmp/log", "schedulers": []}"#;
        assert!(RuntimeConfig::from_json_str(json).is_err());
    }

    #[test]
    fn rejects_out_of_range_scheduler_id() {
        let json = r#"{"log_path": "/tmp/log", "schedulers": [42]}"#;
        assert!(RuntimeConfig::from_json_str(json).is_err());
    }

    #[test]
    fn planner_cpu_masks_falls_back_to_cpu_masks() {
        let json = r#"{"log_path": "/tmp/log", "schedulers": [0], "cpu_masks": "big"}"#;
        let config = RuntimeConfig::from_json_str(json).unwrap();
        assert_eq!(config.planner_cpu_masks(), "big");
    }

    #[test]
    fn rejects_zero_schedule_window_size() {
        let json = r#"{"log_path": "/tmp/log", "schedulers": [0], "schedule_window_size": 0}"#;
        assert!(RuntimeConfig::from_json_str(json).is_err());
    }

    #[test]
    fn from_reader_parses_the_same_as_from_json_str() {
        let json = r#"{"log_path": "/tmp/log", "schedulers": [0]}"#;
        let config = RuntimeConfig::from_reader(json.as_bytes()).unwrap();
        assert_eq!(config.log_path, "/tmp/log");
    }
}
