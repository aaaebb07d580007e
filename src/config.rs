// Top-level configuration with per-subsystem sections

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::PromptCacheConfig;
use crate::models::ModelManagerConfig;
use crate::scheduler::SchedulerConfig;
use crate::thermal::ThermalGuardConfig;

/// Thermal section as it appears in configuration files; converted into the
/// guard's runtime config on normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfigSection {
    #[serde(default = "default_sample_interval_s")]
    pub sample_interval_s: u64,
    #[serde(default = "default_warning_c")]
    pub warning_c: f64,
    #[serde(default = "default_critical_c")]
    pub critical_c: f64,
    #[serde(default = "default_probe_timeout_s")]
    pub probe_timeout_s: u64,
}

fn default_sample_interval_s() -> u64 {
    5
}

fn default_warning_c() -> f64 {
    85.0
}

fn default_critical_c() -> f64 {
    90.0
}

fn default_probe_timeout_s() -> u64 {
    3
}

impl Default for ThermalConfigSection {
    fn default() -> Self {
        Self {
            sample_interval_s: default_sample_interval_s(),
            warning_c: default_warning_c(),
            critical_c: default_critical_c(),
            probe_timeout_s: default_probe_timeout_s(),
        }
    }
}

impl ThermalConfigSection {
    /// Guard config with the scheduler's batch size as the NORMAL-state hint.
    pub fn guard_config(&self, default_batch_size: usize) -> ThermalGuardConfig {
        ThermalGuardConfig {
            sample_interval: Duration::from_secs(self.sample_interval_s.max(1)),
            warning_c: self.warning_c,
            critical_c: self.critical_c,
            probe_timeout: Duration::from_secs(self.probe_timeout_s.max(1)),
            default_batch_size,
        }
        .normalized()
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub thermal: ThermalConfigSection,
    #[serde(default)]
    pub models: ModelManagerConfig,
    #[serde(default)]
    pub cache: PromptCacheConfig,
}

impl OrchestratorConfig {
    /// Load from a JSON file; missing sections fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let payload = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&payload)?;
        Ok(config.normalized())
    }

    /// Clamp out-of-range values in every section.
    pub fn normalized(mut self) -> Self {
        self.scheduler = self.scheduler.normalized();
        self.thermal.critical_c = self.thermal.critical_c.max(self.thermal.warning_c);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("configuration parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}
