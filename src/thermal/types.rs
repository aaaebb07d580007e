// Thermal reading/status types and trend tracking

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Thermal state classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    /// Below the warning threshold; full acceleration.
    Normal,
    /// At or above warning, below critical; reduced performance.
    Throttled,
    /// At or above critical; minimal work only.
    Emergency,
    /// No probe produced a temperature.
    Unknown,
}

/// Resource availability states derived from memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Optimal,
    Moderate,
    High,
    Critical,
}

impl ResourceState {
    /// Classify a normalized pressure value (0.0..=1.0).
    pub fn from_pressure(pressure: f64) -> Self {
        if pressure >= 0.95 {
            ResourceState::Critical
        } else if pressure >= 0.8 {
            ResourceState::High
        } else if pressure >= 0.6 {
            ResourceState::Moderate
        } else {
            ResourceState::Optimal
        }
    }
}

/// Raw reading returned by a probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalReading {
    pub temperature_c: Option<f64>,
    pub warning_c: Option<f64>,
    pub critical_c: Option<f64>,
    /// Probe identifier, e.g. "linux:sysfs".
    pub source: String,
    /// Probe-specific detail (sensor counts, power draws, ...).
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

/// Normalized status produced by the classifier. Never mutated after
/// construction; readers get clones.
#[derive(Debug, Clone, Serialize)]
pub struct ThermalStatus {
    pub temperature_c: Option<f64>,
    pub state: ThermalState,
    pub warning_c: f64,
    pub critical_c: f64,
    pub source: String,
    pub details: HashMap<String, serde_json::Value>,
}

impl ThermalStatus {
    /// Default status before any sample has been collected.
    pub fn unknown(warning_c: f64, critical_c: f64) -> Self {
        Self {
            temperature_c: None,
            state: ThermalState::Unknown,
            warning_c,
            critical_c,
            source: "none".to_string(),
            details: HashMap::new(),
        }
    }
}

/// Direction of recent temperature movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalTrend {
    Cooling,
    Heating,
    Stable,
    Rapid,
}

/// Bounded history of readings for trend analysis.
pub struct TemperatureHistory {
    readings: Vec<(u64, f64)>, // (timestamp_ms, temperature)
    max_size: usize,
}

impl TemperatureHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            readings: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn add_reading(&mut self, timestamp_ms: u64, temp: f64) {
        self.readings.push((timestamp_ms, temp));
        if self.readings.len() > self.max_size {
            self.readings.remove(0);
        }
    }

    pub fn recent(&self, n: usize) -> &[(u64, f64)] {
        let start = self.readings.len().saturating_sub(n);
        &self.readings[start..]
    }

    pub fn trend(&self, window_ms: u64) -> ThermalTrend {
        if self.readings.len() < 3 {
            return ThermalTrend::Stable;
        }

        let now = self.readings.last().map(|(ts, _)| *ts).unwrap_or(0);
        let recent: Vec<_> = self
            .readings
            .iter()
            .filter(|(ts, _)| now - ts <= window_ms)
            .collect();

        if recent.len() < 3 {
            return ThermalTrend::Stable;
        }

        let first_temp = recent[0].1;
        let last_temp = recent[recent.len() - 1].1;
        let temp_change = last_temp - first_temp;

        match temp_change {
            x if x > 5.0 => ThermalTrend::Rapid,
            x if x > 1.0 => ThermalTrend::Heating,
            x if x < -5.0 => ThermalTrend::Rapid,
            x if x < -1.0 => ThermalTrend::Cooling,
            _ => ThermalTrend::Stable,
        }
    }
}
