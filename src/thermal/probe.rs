// Thermal probes: kernel sensor files, vendor power-monitor CLI, sysinfo

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use sysinfo::Components;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;

use crate::thermal::types::ThermalReading;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),
    #[error("probe output invalid: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single source of thermal readings.
///
/// Probes are polled in order by the guard; the first probe returning a
/// reading with a temperature wins. Each invocation is bounded by the
/// guard's per-probe timeout and probes are never invoked concurrently
/// with themselves.
#[async_trait]
pub trait ThermalProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn sample(&self) -> Result<ThermalReading, ProbeError>;
}

/// Probe reading temperatures from kernel sensor files
/// (`/sys/class/thermal/thermal_zone*`).
pub struct SysfsProbe {
    root: PathBuf,
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/sys/class/thermal"))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Kernels report millidegrees, some decidegrees, a few plain Celsius.
    fn normalize_temperature(raw: &str) -> Result<f64, ProbeError> {
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| ProbeError::Parse(format!("invalid thermal value: {raw:?}")))?;

        if value > 1000.0 {
            Ok(value / 1000.0)
        } else if value > 200.0 {
            Ok(value / 10.0)
        } else {
            Ok(value)
        }
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThermalProbe for SysfsProbe {
    fn name(&self) -> &str {
        "linux:sysfs"
    }

    async fn sample(&self) -> Result<ThermalReading, ProbeError> {
        if !self.root.exists() {
            return Err(ProbeError::Unavailable(
                "thermal sysfs directory not available".to_string(),
            ));
        }

        let mut temperatures: Vec<f64> = Vec::new();
        let mut thresholds: Vec<f64> = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let zone = entry?.path();
            let zone_name = zone
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if !zone_name.starts_with("thermal_zone") {
                continue;
            }

            let raw_temp = match std::fs::read_to_string(zone.join("temp")) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            if raw_temp.trim().is_empty() {
                continue;
            }
            temperatures.push(Self::normalize_temperature(&raw_temp)?);

            if let Ok(files) = std::fs::read_dir(&zone) {
                for trip in files.flatten() {
                    let trip_name = trip.file_name();
                    let trip_name = trip_name.to_string_lossy();
                    if !trip_name.starts_with("trip_point_") || !trip_name.ends_with("_temp") {
                        continue;
                    }
                    if let Ok(raw_trip) = std::fs::read_to_string(trip.path()) {
                        if raw_trip.trim().is_empty() {
                            continue;
                        }
                        if let Ok(value) = Self::normalize_temperature(&raw_trip) {
                            thresholds.push(value);
                        }
                    }
                }
            }
        }

        if temperatures.is_empty() {
            return Err(ProbeError::Unavailable(
                "no thermal zones reported temperatures".to_string(),
            ));
        }

        let warning = thresholds
            .iter()
            .copied()
            .filter(|v| *v > 0.0)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
        let critical = thresholds
            .iter()
            .copied()
            .filter(|v| *v > 0.0)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        let hottest = temperatures.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut details = HashMap::new();
        details.insert("zones".to_string(), serde_json::json!(temperatures.len()));

        Ok(ThermalReading {
            temperature_c: Some(hottest),
            warning_c: warning,
            critical_c: critical,
            source: self.name().to_string(),
            details,
        })
    }
}

/// One JSON sample emitted by a macmon-style power monitor CLI.
#[derive(Debug, Deserialize)]
struct PowerMonitorSample {
    pub temp: Option<PowerMonitorTemp>,
    pub memory: Option<PowerMonitorMemory>,
    pub cpu_power: Option<f64>,
    pub gpu_power: Option<f64>,
    pub ane_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PowerMonitorTemp {
    pub cpu_temp_avg: Option<f64>,
    pub gpu_temp_avg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PowerMonitorMemory {
    pub ram_total: Option<u64>,
    pub ram_usage: Option<u64>,
}

/// Probe spawning a vendor power-monitor CLI and parsing its first JSON
/// sample line.
pub struct PowerMonitorProbe {
    command: String,
    args: Vec<String>,
}

impl PowerMonitorProbe {
    pub fn new() -> Self {
        Self::with_command(
            "macmon",
            vec!["pipe".to_string(), "-s".to_string(), "1".to_string()],
        )
    }

    pub fn with_command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl Default for PowerMonitorProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThermalProbe for PowerMonitorProbe {
    fn name(&self) -> &str {
        "vendor:power-monitor"
    }

    async fn sample(&self) -> Result<ThermalReading, ProbeError> {
        let mut child = TokioCommand::new(&self.command)
            .args(&self.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::Unavailable(format!("{}: {e}", self.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::Unavailable("no stdout from power monitor".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let line = loop {
            match lines.next_line().await? {
                Some(line) if !line.trim().is_empty() => break line,
                Some(_) => continue,
                None => {
                    let _ = child.kill().await;
                    return Err(ProbeError::Unavailable(
                        "power monitor produced no output".to_string(),
                    ));
                }
            }
        };
        let _ = child.kill().await;

        let sample: PowerMonitorSample = serde_json::from_str(&line)
            .map_err(|e| ProbeError::Parse(format!("bad power monitor JSON: {e}")))?;

        let cpu_temp = sample.temp.as_ref().and_then(|t| t.cpu_temp_avg);
        let gpu_temp = sample.temp.as_ref().and_then(|t| t.gpu_temp_avg);
        let temperature = match (cpu_temp, gpu_temp) {
            (Some(c), Some(g)) => Some(c.max(g)),
            (Some(c), None) => Some(c),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        };

        let mut details = HashMap::new();
        if let Some(w) = sample.cpu_power {
            details.insert("cpu_power_watts".to_string(), serde_json::json!(w));
        }
        if let Some(w) = sample.gpu_power {
            details.insert("gpu_power_watts".to_string(), serde_json::json!(w));
        }
        if let Some(w) = sample.ane_power {
            details.insert("ane_power_watts".to_string(), serde_json::json!(w));
        }
        if let Some(mem) = &sample.memory {
            if let (Some(total), Some(used)) = (mem.ram_total, mem.ram_usage) {
                if total > 0 {
                    details.insert(
                        "ram_pressure".to_string(),
                        serde_json::json!(used as f64 / total as f64),
                    );
                }
            }
        }

        Ok(ThermalReading {
            temperature_c: temperature,
            warning_c: None,
            critical_c: None,
            source: self.name().to_string(),
            details,
        })
    }
}

/// Probe backed by the generic sensor list exposed through `sysinfo`.
pub struct ComponentsProbe;

impl ComponentsProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComponentsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThermalProbe for ComponentsProbe {
    fn name(&self) -> &str {
        "sysinfo:components"
    }

    async fn sample(&self) -> Result<ThermalReading, ProbeError> {
        let components = Components::new_with_refreshed_list();

        let mut hottest: Option<(String, f32, Option<f32>)> = None;
        let mut sensor_count = 0usize;
        for component in &components {
            let temp = component.temperature();
            // Sensors occasionally report 0 or absurd values; skip them.
            if !(0.0..150.0).contains(&temp) || temp == 0.0 {
                continue;
            }
            sensor_count += 1;
            let is_hotter = hottest.as_ref().map_or(true, |(_, t, _)| temp > *t);
            if is_hotter {
                hottest = Some((component.label().to_string(), temp, component.critical()));
            }
        }

        let (label, temp, critical) = hottest.ok_or_else(|| {
            ProbeError::Unavailable("no temperature sensors reported".to_string())
        })?;

        let mut details = HashMap::new();
        details.insert("sensors".to_string(), serde_json::json!(sensor_count));
        details.insert("label".to_string(), serde_json::json!(label));

        Ok(ThermalReading {
            temperature_c: Some(temp as f64),
            warning_c: None,
            critical_c: critical.map(|c| c as f64),
            source: self.name().to_string(),
            details,
        })
    }
}

/// Platform-aware default probe ordering: the generic sensor library first,
/// then the platform-specific source.
pub fn default_probes() -> Vec<Box<dyn ThermalProbe>> {
    let mut probes: Vec<Box<dyn ThermalProbe>> = vec![Box::new(ComponentsProbe::new())];

    #[cfg(target_os = "linux")]
    probes.push(Box::new(SysfsProbe::new()));

    #[cfg(target_os = "macos")]
    probes.push(Box::new(PowerMonitorProbe::new()));

    probes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_millidegree_and_decidegree_values() {
        assert_eq!(SysfsProbe::normalize_temperature("45000").unwrap(), 45.0);
        assert_eq!(SysfsProbe::normalize_temperature("450").unwrap(), 45.0);
        assert_eq!(SysfsProbe::normalize_temperature("45").unwrap(), 45.0);
        assert!(SysfsProbe::normalize_temperature("garbage").is_err());
    }

    #[tokio::test]
    async fn sysfs_probe_reads_zones_and_trip_points() {
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("thermal_zone0");
        std::fs::create_dir(&zone).unwrap();
        std::fs::write(zone.join("temp"), "72000\n").unwrap();
        std::fs::write(zone.join("trip_point_0_temp"), "85000\n").unwrap();
        std::fs::write(zone.join("trip_point_1_temp"), "95000\n").unwrap();

        let probe = SysfsProbe::with_root(dir.path().to_path_buf());
        let reading = probe.sample().await.unwrap();
        assert_eq!(reading.temperature_c, Some(72.0));
        assert_eq!(reading.warning_c, Some(85.0));
        assert_eq!(reading.critical_c, Some(95.0));
    }

    #[tokio::test]
    async fn sysfs_probe_fails_without_zones() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SysfsProbe::with_root(dir.path().to_path_buf());
        assert!(probe.sample().await.is_err());
    }

    #[tokio::test]
    async fn power_monitor_probe_parses_sample_line() {
        let probe = PowerMonitorProbe::with_command(
            "echo",
            vec![r#"{"temp":{"cpu_temp_avg":61.5,"gpu_temp_avg":58.0},"cpu_power":4.2}"#.to_string()],
        );
        let reading = probe.sample().await.unwrap();
        assert_eq!(reading.temperature_c, Some(61.5));
        assert_eq!(
            reading.details.get("cpu_power_watts"),
            Some(&serde_json::json!(4.2))
        );
    }

    #[tokio::test]
    async fn power_monitor_probe_reports_missing_binary() {
        let probe = PowerMonitorProbe::with_command("definitely-not-a-real-binary", vec![]);
        assert!(probe.sample().await.is_err());
    }
}
