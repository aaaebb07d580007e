// Thermal guard: periodic sampling, classification, recommendations

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::events::{event_types, EventBus};
use crate::thermal::probe::ThermalProbe;
use crate::thermal::types::{
    ResourceState, TemperatureHistory, ThermalState, ThermalStatus, ThermalTrend,
};

const STOP_GRACE: Duration = Duration::from_secs(5);
const TREND_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct ThermalGuardConfig {
    pub sample_interval: Duration,
    pub warning_c: f64,
    pub critical_c: f64,
    pub probe_timeout: Duration,
    /// Batch size recommended while NORMAL; wired to the scheduler's
    /// configured batch size by the orchestrator.
    pub default_batch_size: usize,
}

impl Default for ThermalGuardConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            warning_c: 85.0,
            critical_c: 90.0,
            probe_timeout: Duration::from_secs(3),
            default_batch_size: 4,
        }
    }
}

impl ThermalGuardConfig {
    /// Enforce `critical_c >= warning_c`.
    pub fn normalized(mut self) -> Self {
        self.critical_c = self.critical_c.max(self.warning_c);
        self
    }
}

/// Classify a temperature against effective thresholds. Pure function of
/// its inputs.
pub fn classify(temperature_c: Option<f64>, warning_c: f64, critical_c: f64) -> ThermalState {
    match temperature_c {
        None => ThermalState::Unknown,
        Some(t) if t >= critical_c => ThermalState::Emergency,
        Some(t) if t >= warning_c => ThermalState::Throttled,
        Some(_) => ThermalState::Normal,
    }
}

/// Guidance for model loading and batch formation derived from the current
/// thermal and resource state.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub can_load_large: bool,
    pub batch_size_hint: usize,
    pub post_inference_delay_ms: u64,
    pub reason: String,
}

/// Summary statistics for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ThermalStats {
    pub state: ThermalState,
    pub resource_state: ResourceState,
    pub avg_temperature_c: Option<f64>,
    pub max_temperature_c: Option<f64>,
    pub trend: ThermalTrend,
    pub throttle_events: u64,
    pub emergency_events: u64,
    pub samples_collected: u64,
    pub source: String,
}

type StateHandler = Box<dyn Fn(&ThermalStatus) + Send + Sync>;

struct Subscriber {
    handler: StateHandler,
    failed: AtomicBool,
}

struct GuardInner {
    config: ThermalGuardConfig,
    probes: tokio::sync::Mutex<Vec<Box<dyn ThermalProbe>>>,
    status: RwLock<ThermalStatus>,
    resource: RwLock<ResourceState>,
    memory_pressure: RwLock<f64>,
    model_pressure: RwLock<f64>,
    subscribers: Mutex<Vec<Subscriber>>,
    history: Mutex<TemperatureHistory>,
    system: Mutex<System>,
    throttle_events: AtomicU64,
    emergency_events: AtomicU64,
    samples_collected: AtomicU64,
    events: Option<EventBus>,
}

/// Periodic sampler over an ordered probe list, publishing state
/// transitions and answering synchronous state queries.
pub struct ThermalGuard {
    inner: Arc<GuardInner>,
    stop: Arc<AtomicBool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ThermalGuard {
    pub fn new(config: ThermalGuardConfig, probes: Vec<Box<dyn ThermalProbe>>) -> Self {
        Self::build(config, probes, None)
    }

    pub fn with_events(
        config: ThermalGuardConfig,
        probes: Vec<Box<dyn ThermalProbe>>,
        events: EventBus,
    ) -> Self {
        Self::build(config, probes, Some(events))
    }

    fn build(
        config: ThermalGuardConfig,
        probes: Vec<Box<dyn ThermalProbe>>,
        events: Option<EventBus>,
    ) -> Self {
        let config = config.normalized();
        let initial = ThermalStatus::unknown(config.warning_c, config.critical_c);
        Self {
            inner: Arc::new(GuardInner {
                probes: tokio::sync::Mutex::new(probes),
                status: RwLock::new(initial),
                resource: RwLock::new(ResourceState::Optimal),
                memory_pressure: RwLock::new(0.0),
                model_pressure: RwLock::new(0.0),
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(TemperatureHistory::new(720)),
                system: Mutex::new(System::new()),
                throttle_events: AtomicU64::new(0),
                emergency_events: AtomicU64::new(0),
                samples_collected: AtomicU64::new(0),
                events,
                config,
            }),
            stop: Arc::new(AtomicBool::new(false)),
            sampler: Mutex::new(None),
        }
    }

    /// Begin periodic sampling. Idempotent.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock().unwrap();
        if sampler.as_ref().map_or(false, |h| !h.is_finished()) {
            warn!("thermal sampler already running");
            return;
        }

        self.stop.store(false, Ordering::Relaxed);
        let inner = self.inner.clone();
        let stop = self.stop.clone();
        let interval = inner.config.sample_interval;

        info!(
            "starting thermal sampling (interval {:?}, warning {:.1}C, critical {:.1}C)",
            interval, inner.config.warning_c, inner.config.critical_c
        );

        *sampler = Some(tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                Self::tick(&inner).await;
                tokio::time::sleep(interval).await;
            }
            debug!("thermal sampler stopped");
        }));
    }

    /// Cease sampling; wait briefly for the in-flight sample, then abort.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.sampler.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("thermal sampler did not stop gracefully; aborting");
                abort.abort();
            }
        }
        info!("thermal sampling stopped");
    }

    /// Collect one sample immediately, outside the periodic cadence.
    pub async fn sample_now(&self) {
        Self::tick(&self.inner).await;
    }

    /// Last classified status (a default UNKNOWN before the first sample).
    pub fn current(&self) -> ThermalStatus {
        self.inner.status.read().unwrap().clone()
    }

    pub fn resource_state(&self) -> ResourceState {
        *self.inner.resource.read().unwrap()
    }

    /// Register a callback invoked on every state change. A handler that
    /// panics is logged and skipped on future events. Handlers run on the
    /// sampler task and must not block or re-enter the guard.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ThermalStatus) + Send + Sync + 'static,
    {
        self.inner.subscribers.lock().unwrap().push(Subscriber {
            handler: Box::new(handler),
            failed: AtomicBool::new(false),
        });
    }

    /// Model-memory pressure reported by the model manager; folded into the
    /// resource state alongside system memory.
    pub fn report_model_pressure(&self, pressure: f64) {
        *self.inner.model_pressure.write().unwrap() = pressure.clamp(0.0, 1.0);
        let combined = self.combined_pressure();
        *self.inner.resource.write().unwrap() = ResourceState::from_pressure(combined);
    }

    fn combined_pressure(&self) -> f64 {
        let mem = *self.inner.memory_pressure.read().unwrap();
        let model = *self.inner.model_pressure.read().unwrap();
        mem.max(model)
    }

    /// Guidance derived from the current status and resource pressure.
    pub fn recommendation(&self) -> Recommendation {
        let status = self.current();
        let resource = self.resource_state();
        let default_batch = self.inner.config.default_batch_size;

        match status.state {
            ThermalState::Emergency => Recommendation {
                can_load_large: false,
                batch_size_hint: 1,
                post_inference_delay_ms: 2000,
                reason: format!(
                    "temperature critical: {:.1}C",
                    status.temperature_c.unwrap_or(status.critical_c)
                ),
            },
            ThermalState::Throttled => Recommendation {
                can_load_large: false,
                batch_size_hint: 2,
                post_inference_delay_ms: 1000,
                reason: format!(
                    "temperature high: {:.1}C",
                    status.temperature_c.unwrap_or(status.warning_c)
                ),
            },
            ThermalState::Unknown => Recommendation {
                can_load_large: true,
                batch_size_hint: default_batch,
                post_inference_delay_ms: 0,
                reason: "no sensor data".to_string(),
            },
            ThermalState::Normal => {
                let delay = match resource {
                    ResourceState::High => 200,
                    ResourceState::Critical => 500,
                    _ => 0,
                };
                Recommendation {
                    can_load_large: true,
                    batch_size_hint: default_batch,
                    post_inference_delay_ms: delay,
                    reason: format!("normal operation (resource {resource:?})"),
                }
            }
        }
    }

    pub fn stats(&self) -> ThermalStats {
        let status = self.current();
        let (avg, max, trend) = {
            let history = self.inner.history.lock().unwrap();
            let recent = history.recent(10);
            if recent.is_empty() {
                (None, None, ThermalTrend::Stable)
            } else {
                let sum: f64 = recent.iter().map(|(_, t)| t).sum();
                let max = recent.iter().map(|(_, t)| *t).fold(f64::NEG_INFINITY, f64::max);
                (
                    Some(sum / recent.len() as f64),
                    Some(max),
                    history.trend(TREND_WINDOW_MS),
                )
            }
        };

        ThermalStats {
            state: status.state,
            resource_state: self.resource_state(),
            avg_temperature_c: avg,
            max_temperature_c: max,
            trend,
            throttle_events: self.inner.throttle_events.load(Ordering::Relaxed),
            emergency_events: self.inner.emergency_events.load(Ordering::Relaxed),
            samples_collected: self.inner.samples_collected.load(Ordering::Relaxed),
            source: status.source,
        }
    }

    async fn tick(inner: &Arc<GuardInner>) {
        Self::refresh_memory_pressure(inner);

        let status = Self::collect_status(inner).await;
        inner.samples_collected.fetch_add(1, Ordering::Relaxed);

        if let Some(temp) = status.temperature_c {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            inner.history.lock().unwrap().add_reading(now_ms, temp);
        }

        let previous = inner.status.read().unwrap().state;
        if status.state != previous {
            info!(
                "thermal state changed: {:?} -> {:?} ({:?}C via {})",
                previous, status.state, status.temperature_c, status.source
            );
            match status.state {
                ThermalState::Throttled => {
                    inner.throttle_events.fetch_add(1, Ordering::Relaxed);
                }
                ThermalState::Emergency => {
                    inner.emergency_events.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            Self::notify_subscribers(inner, &status);
            Self::emit_transition(inner, &status);
        }

        *inner.status.write().unwrap() = status;
    }

    fn refresh_memory_pressure(inner: &Arc<GuardInner>) {
        let pressure = {
            let mut system = inner.system.lock().unwrap();
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                0.0
            } else {
                system.used_memory() as f64 / total as f64
            }
        };
        *inner.memory_pressure.write().unwrap() = pressure;
        let model = *inner.model_pressure.read().unwrap();
        *inner.resource.write().unwrap() = ResourceState::from_pressure(pressure.max(model));
    }

    async fn collect_status(inner: &Arc<GuardInner>) -> ThermalStatus {
        let mut last_error: Option<String> = None;
        let probes = inner.probes.lock().await;

        for probe in probes.iter() {
            let reading = match timeout(inner.config.probe_timeout, probe.sample()).await {
                Ok(Ok(reading)) => reading,
                Ok(Err(e)) => {
                    debug!("probe {} failed: {e}", probe.name());
                    last_error = Some(format!("{}: {e}", probe.name()));
                    continue;
                }
                Err(_) => {
                    debug!("probe {} timed out", probe.name());
                    last_error = Some(format!("{}: timed out", probe.name()));
                    continue;
                }
            };

            let Some(temperature) = reading.temperature_c else {
                last_error = Some(format!("{}: returned no temperature", probe.name()));
                continue;
            };

            let warning = reading.warning_c.unwrap_or(inner.config.warning_c);
            let critical = reading.critical_c.unwrap_or(inner.config.critical_c).max(warning);

            return ThermalStatus {
                temperature_c: Some((temperature * 100.0).round() / 100.0),
                state: classify(Some(temperature), warning, critical),
                warning_c: warning,
                critical_c: critical,
                source: reading.source,
                details: reading.details,
            };
        }

        let mut details = HashMap::new();
        details.insert("reason".to_string(), serde_json::json!("no_sensor_data"));
        if let Some(err) = last_error {
            details.insert("last_error".to_string(), serde_json::json!(err));
        }

        ThermalStatus {
            temperature_c: None,
            state: ThermalState::Unknown,
            warning_c: inner.config.warning_c,
            critical_c: inner.config.critical_c,
            source: "fallback".to_string(),
            details,
        }
    }

    fn notify_subscribers(inner: &Arc<GuardInner>, status: &ThermalStatus) {
        let subscribers = inner.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            if subscriber.failed.load(Ordering::Relaxed) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(status)));
            if result.is_err() {
                error!("thermal subscriber panicked; skipping it on future events");
                subscriber.failed.store(true, Ordering::Relaxed);
            }
        }
    }

    fn emit_transition(inner: &Arc<GuardInner>, status: &ThermalStatus) {
        let Some(events) = &inner.events else { return };
        let event_type = match status.state {
            ThermalState::Emergency => event_types::THERMAL_CRITICAL,
            ThermalState::Throttled => event_types::THERMAL_WARNING,
            _ => event_types::THERMAL_STATUS,
        };
        events.emit(
            event_type,
            "urn:orchard:thermal",
            serde_json::json!({
                "temperature_c": status.temperature_c,
                "state": status.state,
                "warning_c": status.warning_c,
                "critical_c": status.critical_c,
                "source": status.source,
            }),
        );
    }
}
