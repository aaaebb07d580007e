// On-device inference orchestration: thermal-aware batching over a tiered,
// memory-budgeted set of local model backends.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod thermal;

// Re-export error kinds for callers reacting to failed responses
pub use error::{ErrorKind, RequestError};

// Re-export the runtime seam implemented by model backends
pub use runtime::{
    GenerateParams, Generation, LoadedHandles, ModelHandle, Runtime, RuntimeError, TokenizerHandle,
};

// Re-export thermal monitoring types
pub use thermal::{
    classify, default_probes, ComponentsProbe, PowerMonitorProbe, ProbeError, Recommendation,
    ResourceState, SysfsProbe, ThermalGuard, ThermalGuardConfig, ThermalProbe, ThermalReading,
    ThermalState, ThermalStats, ThermalStatus, ThermalTrend,
};

// Re-export model management types
pub use models::{
    ManagerSnapshot, ModelCatalog, ModelConfig, ModelLease, ModelManager, ModelManagerConfig,
    ModelPriority, ModelTier,
};

// Re-export the prompt cache
pub use cache::{CacheHit, CacheStats, PromptCache, PromptCacheConfig};

// Re-export the scheduler surface
pub use scheduler::{
    InferenceRequest, InferenceResponse, InferenceScheduler, PerfStats, Priority, QueueStats,
    ResponseHandle, SchedulerConfig, META_CACHE_KEY, META_TASK,
};

// Re-export configuration and the assembled facade
pub use config::{ConfigError, OrchestratorConfig, ThermalConfigSection};
pub use events::{EventBus, EventEnvelope};
pub use orchestrator::Orchestrator;
