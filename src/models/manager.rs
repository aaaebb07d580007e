// Tiered model manager: budgeted loading, eviction, task resolution

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::events::{event_types, EventBus};
use crate::models::catalog::{ModelCatalog, ModelConfig, ModelTier, GIB};
use crate::models::complexity::select_candidates;
use crate::runtime::{LoadedHandles, Runtime};
use crate::thermal::ThermalGuard;

/// Memory pressure thresholds.
pub const WARN_PRESSURE: f64 = 0.80;
pub const CRITICAL_PRESSURE: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManagerConfig {
    /// Hard budget; `used_bytes` never exceeds it.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Advisory per-tier caps; exceeding one logs a warning only.
    #[serde(default = "default_always_on_cap")]
    pub always_on_cap_bytes: u64,
    #[serde(default = "default_frequent_cap")]
    pub frequent_cap_bytes: u64,
    #[serde(default = "default_on_demand_cap")]
    pub on_demand_cap_bytes: u64,
}

fn default_max_memory_bytes() -> u64 {
    28 * GIB
}

fn default_always_on_cap() -> u64 {
    GIB
}

fn default_frequent_cap() -> u64 {
    5 * GIB
}

fn default_on_demand_cap() -> u64 {
    22 * GIB
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            always_on_cap_bytes: default_always_on_cap(),
            frequent_cap_bytes: default_frequent_cap(),
            on_demand_cap_bytes: default_on_demand_cap(),
        }
    }
}

impl ModelManagerConfig {
    fn tier_cap(&self, tier: ModelTier) -> u64 {
        match tier {
            ModelTier::AlwaysOn => self.always_on_cap_bytes,
            ModelTier::Frequent => self.frequent_cap_bytes,
            ModelTier::OnDemand => self.on_demand_cap_bytes,
        }
    }
}

/// A model resident in memory. Owned exclusively by the manager.
struct LoadedModel {
    config: ModelConfig,
    handles: LoadedHandles,
    loaded_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl LoadedModel {
    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }
}

/// Cheap checkout of a loaded model for an inference call.
#[derive(Clone)]
pub struct ModelLease {
    pub config: ModelConfig,
    pub handles: LoadedHandles,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub tier: ModelTier,
    pub ram_bytes: u64,
    pub last_used_ms: u64,
    pub use_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub memory_pressure: f64,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub status: String,
    pub models: Vec<ModelSnapshot>,
    pub total_loads: u64,
    pub total_evictions: u64,
    pub load_failures: u64,
}

struct ManagerState {
    loaded: HashMap<String, LoadedModel>,
    used_bytes: u64,
}

impl ManagerState {
    fn pressure(&self, max_bytes: u64) -> f64 {
        if max_bytes == 0 {
            1.0
        } else {
            self.used_bytes as f64 / max_bytes as f64
        }
    }

    fn tier_usage(&self, tier: ModelTier) -> u64 {
        self.loaded
            .values()
            .filter(|m| m.config.tier == tier)
            .map(|m| m.config.ram_bytes)
            .sum()
    }
}

enum LoadOutcome {
    AlreadyLoaded,
    Loaded { evicted: Vec<String> },
    NoCapacity { evicted: Vec<String> },
    LoadFailed(String),
}

/// Memory-budgeted owner of loaded models.
///
/// All mutations of `(loaded, used_bytes)` happen under one async lock held
/// across the runtime load, so no interleaving of concurrent loads can
/// exceed the budget (loads serialize; lookups wait briefly).
pub struct ModelManager {
    catalog: ModelCatalog,
    runtime: Arc<dyn Runtime>,
    config: ModelManagerConfig,
    state: tokio::sync::Mutex<ManagerState>,
    thermal: RwLock<Option<Arc<ThermalGuard>>>,
    events: Option<EventBus>,
    total_loads: AtomicU64,
    total_evictions: AtomicU64,
    load_failures: AtomicU64,
}

impl ModelManager {
    pub fn new(catalog: ModelCatalog, runtime: Arc<dyn Runtime>, config: ModelManagerConfig) -> Self {
        Self::build(catalog, runtime, config, None)
    }

    pub fn with_events(
        catalog: ModelCatalog,
        runtime: Arc<dyn Runtime>,
        config: ModelManagerConfig,
        events: EventBus,
    ) -> Self {
        Self::build(catalog, runtime, config, Some(events))
    }

    fn build(
        catalog: ModelCatalog,
        runtime: Arc<dyn Runtime>,
        config: ModelManagerConfig,
        events: Option<EventBus>,
    ) -> Self {
        info!(
            "model manager initialized ({} models, {:.1} GiB budget)",
            catalog.len(),
            config.max_memory_bytes as f64 / GIB as f64
        );
        Self {
            catalog,
            runtime,
            config,
            state: tokio::sync::Mutex::new(ManagerState {
                loaded: HashMap::new(),
                used_bytes: 0,
            }),
            thermal: RwLock::new(None),
            events,
            total_loads: AtomicU64::new(0),
            total_evictions: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
        }
    }

    pub fn set_thermal_guard(&self, guard: Arc<ThermalGuard>) {
        *self.thermal.write().unwrap() = Some(guard);
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Whether the thermal guard currently permits loading a large model.
    pub fn can_load_large(&self) -> bool {
        self.thermal
            .read()
            .unwrap()
            .as_ref()
            .map_or(true, |guard| guard.recommendation().can_load_large)
    }

    /// Load every ALWAYS_ON model. Failures are logged; the system continues
    /// in a degraded mode.
    pub async fn bootstrap(&self) {
        let names: Vec<String> = self
            .catalog
            .tier_members(ModelTier::AlwaysOn)
            .into_iter()
            .map(|c| c.name.clone())
            .collect();
        for name in names {
            if self.load(&name).await {
                info!("bootstrapped always-on model {name}");
            } else {
                warn!("failed to bootstrap always-on model {name}; continuing degraded");
            }
        }
    }

    /// Load a model, evicting as needed. Idempotent: an already-loaded model
    /// is touched and reported as success.
    pub async fn load(&self, name: &str) -> bool {
        let Some(config) = self.catalog.get(name).cloned() else {
            error!("unknown model: {name}");
            return false;
        };

        // Thermal ceiling applies to large loads only; checked before the
        // state lock (lock order: thermal before manager).
        if config.tier == ModelTier::OnDemand && !self.can_load_large() {
            warn!("refusing to load {name}: thermal guard forbids large loads");
            return false;
        }

        let outcome = {
            let mut state = self.state.lock().await;

            if let Some(loaded) = state.loaded.get_mut(name) {
                loaded.touch();
                LoadOutcome::AlreadyLoaded
            } else {
                let mut evicted = Vec::new();
                if !Self::evict_for_space(&mut state, &self.config, config.ram_bytes, &mut evicted)
                {
                    LoadOutcome::NoCapacity { evicted }
                } else {
                    let tier_usage = state.tier_usage(config.tier);
                    let cap = self.config.tier_cap(config.tier);
                    if tier_usage + config.ram_bytes > cap {
                        warn!(
                            "tier {:?} exceeds advisory cap after loading {name} ({} > {} bytes)",
                            config.tier,
                            tier_usage + config.ram_bytes,
                            cap
                        );
                    }

                    debug!("loading model {name} ({} bytes)", config.ram_bytes);
                    match self.runtime.load(&config.id).await {
                        Ok(handles) => {
                            let now = Instant::now();
                            state.used_bytes += config.ram_bytes;
                            state.loaded.insert(
                                name.to_string(),
                                LoadedModel {
                                    config: config.clone(),
                                    handles,
                                    loaded_at: now,
                                    last_used: now,
                                    use_count: 0,
                                },
                            );
                            LoadOutcome::Loaded { evicted }
                        }
                        Err(e) => LoadOutcome::LoadFailed(e.to_string()),
                    }
                }
            }
        };

        match outcome {
            LoadOutcome::AlreadyLoaded => true,
            LoadOutcome::Loaded { evicted } => {
                self.total_loads.fetch_add(1, Ordering::Relaxed);
                self.note_evictions(name, &evicted);
                info!("loaded model {name}");
                self.emit_model_event(
                    event_types::MODEL_LOADED,
                    name,
                    serde_json::json!({
                        "ram_bytes": config.ram_bytes,
                        "tier": config.tier,
                    }),
                );
                self.report_pressure().await;
                true
            }
            LoadOutcome::NoCapacity { evicted } => {
                self.note_evictions(name, &evicted);
                warn!("cannot load {name}: insufficient memory after eviction");
                self.report_pressure().await;
                false
            }
            LoadOutcome::LoadFailed(message) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                error!("failed to load model {name}: {message}");
                self.emit_model_event(
                    event_types::MODEL_ERROR,
                    name,
                    serde_json::json!({"error": message}),
                );
                false
            }
        }
    }

    /// Non-loading lookup; touches `last_used` on hit.
    pub async fn get(&self, name: &str) -> Option<ModelLease> {
        let mut state = self.state.lock().await;
        state.loaded.get_mut(name).map(|loaded| {
            loaded.touch();
            ModelLease {
                config: loaded.config.clone(),
                handles: loaded.handles.clone(),
            }
        })
    }

    /// Complexity-based selection: try to load candidates in bucket order,
    /// then fall back to any loaded model whose tags match the task.
    pub async fn resolve(&self, task_description: &str, context_length: u32) -> Option<String> {
        let candidates = select_candidates(&self.catalog, task_description, context_length);
        for name in &candidates {
            if self.load(name).await {
                debug!("resolved task to model {name}");
                return Some(name.clone());
            }
        }

        let task_lower = task_description.to_lowercase();
        let mut state = self.state.lock().await;
        for (name, loaded) in state.loaded.iter_mut() {
            if loaded.config.suits_task(&task_lower) {
                loaded.touch();
                debug!("falling back to already-loaded model {name}");
                return Some(name.clone());
            }
        }

        warn!("no model available for task");
        None
    }

    /// Force-eject a model. ALWAYS_ON models are refused unless memory
    /// pressure is critical.
    pub async fn evict(&self, name: &str) -> bool {
        let evicted = {
            let mut state = self.state.lock().await;
            let always_on = match state.loaded.get(name) {
                None => return false,
                Some(loaded) => loaded.config.tier == ModelTier::AlwaysOn,
            };
            if always_on && state.pressure(self.config.max_memory_bytes) < CRITICAL_PRESSURE {
                warn!("refusing to evict always-on model {name} below critical pressure");
                return false;
            }
            match state.loaded.remove(name) {
                None => false,
                Some(loaded) => {
                    state.used_bytes -= loaded.config.ram_bytes;
                    info!(
                        "evicted model {name} (resident {:?}, used {} times)",
                        loaded.loaded_at.elapsed(),
                        loaded.use_count
                    );
                    true
                }
            }
        };

        if evicted {
            self.total_evictions.fetch_add(1, Ordering::Relaxed);
            self.runtime.clear_cache();
            self.emit_model_event(
                event_types::MODEL_UNLOADED,
                name,
                serde_json::json!({"reason": "forced"}),
            );
            self.report_pressure().await;
        }
        evicted
    }

    pub async fn pressure(&self) -> f64 {
        self.state.lock().await.pressure(self.config.max_memory_bytes)
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let state = self.state.lock().await;
        let pressure = state.pressure(self.config.max_memory_bytes);
        let status = if pressure > CRITICAL_PRESSURE {
            "critical"
        } else if pressure > WARN_PRESSURE {
            "warning"
        } else {
            "normal"
        };

        let mut models: Vec<ModelSnapshot> = state
            .loaded
            .iter()
            .map(|(name, loaded)| ModelSnapshot {
                name: name.clone(),
                tier: loaded.config.tier,
                ram_bytes: loaded.config.ram_bytes,
                last_used_ms: loaded.last_used.elapsed().as_millis() as u64,
                use_count: loaded.use_count,
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));

        ManagerSnapshot {
            memory_pressure: pressure,
            used_bytes: state.used_bytes,
            max_bytes: self.config.max_memory_bytes,
            status: status.to_string(),
            models,
            total_loads: self.total_loads.load(Ordering::Relaxed),
            total_evictions: self.total_evictions.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }

    /// Evict candidates until `need` bytes fit, ascending by
    /// `(priority rank, last_used)`. ALWAYS_ON models join the candidate set
    /// only under critical pressure. Returns false when the deficit cannot
    /// be covered (no eviction is rolled back; partial progress stands).
    fn evict_for_space(
        state: &mut ManagerState,
        config: &ModelManagerConfig,
        need: u64,
        evicted: &mut Vec<String>,
    ) -> bool {
        if need > config.max_memory_bytes {
            return false;
        }
        let available = config.max_memory_bytes - state.used_bytes;
        if available >= need {
            return true;
        }
        let deficit = need - available;
        let critical = state.pressure(config.max_memory_bytes) >= CRITICAL_PRESSURE;

        let mut candidates: Vec<(u8, Instant, String, u64)> = state
            .loaded
            .values()
            .filter(|m| m.config.tier != ModelTier::AlwaysOn || critical)
            .map(|m| {
                (
                    m.config.priority.rank(),
                    m.last_used,
                    m.config.name.clone(),
                    m.config.ram_bytes,
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut freed = 0u64;
        for (_, _, name, ram) in candidates {
            if freed >= deficit {
                break;
            }
            state.loaded.remove(&name);
            state.used_bytes -= ram;
            freed += ram;
            evicted.push(name);
        }

        freed >= deficit
    }

    fn note_evictions(&self, beneficiary: &str, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        self.total_evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        info!("evicted {evicted:?} to make room for {beneficiary}");
        self.runtime.clear_cache();
        for victim in evicted {
            self.emit_model_event(
                event_types::MODEL_UNLOADED,
                victim,
                serde_json::json!({"reason": "memory_pressure"}),
            );
        }
    }

    async fn report_pressure(&self) {
        let pressure = self.pressure().await;
        let guard = self.thermal.read().unwrap().clone();
        if let Some(guard) = guard {
            guard.report_model_pressure(pressure);
        }
    }

    fn emit_model_event(&self, event_type: &str, name: &str, mut data: serde_json::Value) {
        let Some(events) = &self.events else { return };
        if let Some(map) = data.as_object_mut() {
            map.insert("name".to_string(), serde_json::json!(name));
        }
        events.emit(event_type, "urn:orchard:models", data);
    }
}
