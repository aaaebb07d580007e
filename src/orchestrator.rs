// Facade wiring the thermal guard, model manager, prompt cache and scheduler

use log::info;
use std::sync::Arc;

use crate::cache::PromptCache;
use crate::config::OrchestratorConfig;
use crate::events::EventBus;
use crate::models::{ManagerSnapshot, ModelCatalog, ModelManager};
use crate::runtime::Runtime;
use crate::scheduler::{
    InferenceRequest, InferenceScheduler, PerfStats, QueueStats, ResponseHandle,
};
use crate::thermal::{ThermalGuard, ThermalProbe, ThermalStats, ThermalStatus};

/// The assembled orchestrator.
///
/// Construction wires the components; `start` begins thermal sampling,
/// bootstraps ALWAYS_ON models and launches the dispatcher. All inference
/// goes through `submit`.
pub struct Orchestrator {
    thermal: Arc<ThermalGuard>,
    manager: Arc<ModelManager>,
    cache: Arc<PromptCache>,
    scheduler: InferenceScheduler,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        catalog: ModelCatalog,
        runtime: Arc<dyn Runtime>,
        probes: Vec<Box<dyn ThermalProbe>>,
    ) -> std::io::Result<Self> {
        let config = config.normalized();
        let events = EventBus::default();

        let guard_config = config.thermal.guard_config(config.scheduler.batch_size);
        let thermal = Arc::new(ThermalGuard::with_events(
            guard_config,
            probes,
            events.clone(),
        ));

        let manager = Arc::new(ModelManager::with_events(
            catalog,
            runtime.clone(),
            config.models.clone(),
            events.clone(),
        ));
        manager.set_thermal_guard(thermal.clone());

        let cache = Arc::new(PromptCache::new(
            config.cache.clone(),
            manager.clone(),
            runtime.clone(),
        )?);

        let scheduler = InferenceScheduler::with_events(
            config.scheduler.clone(),
            manager.clone(),
            runtime,
            events.clone(),
        );
        scheduler.set_thermal_guard(thermal.clone());
        scheduler.set_prompt_cache(cache.clone());

        Ok(Self {
            thermal,
            manager,
            cache,
            scheduler,
            events,
        })
    }

    /// Start sampling, bootstrap always-on models, start dispatching.
    pub async fn start(&self) {
        self.thermal.start();
        self.manager.bootstrap().await;
        self.scheduler.start();
        info!("orchestrator started");
    }

    /// Stop the scheduler first (draining work), then the sampler.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.thermal.stop().await;
        info!("orchestrator stopped");
    }

    pub async fn submit(&self, request: InferenceRequest) -> ResponseHandle {
        self.scheduler.submit(request).await
    }

    pub fn thermal(&self) -> &Arc<ThermalGuard> {
        &self.thermal
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn prompt_cache(&self) -> &Arc<PromptCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &InferenceScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn thermal_status(&self) -> ThermalStatus {
        self.thermal.current()
    }

    pub fn thermal_stats(&self) -> ThermalStats {
        self.thermal.stats()
    }

    pub async fn model_snapshot(&self) -> ManagerSnapshot {
        self.manager.snapshot().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.queue_stats()
    }

    pub fn perf_stats(&self) -> PerfStats {
        self.scheduler.perf_stats()
    }
}
