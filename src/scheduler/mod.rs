pub mod metrics;
mod queues;
#[allow(clippy::module_inception)]
mod scheduler;
pub mod types;

pub use metrics::{PerfStats, QueueStats, SchedulerMetrics};
pub use scheduler::{InferenceScheduler, SchedulerConfig};
pub use types::{
    InferenceRequest, InferenceResponse, Priority, ResponseHandle, META_CACHE_KEY, META_TASK,
};
