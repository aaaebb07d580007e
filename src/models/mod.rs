pub mod catalog;
pub mod complexity;
pub mod manager;

pub use catalog::{ModelCatalog, ModelConfig, ModelPriority, ModelTier, GIB, MIB};
pub use complexity::{select_candidates, task_complexity};
pub use manager::{
    ManagerSnapshot, ModelLease, ModelManager, ModelManagerConfig, ModelSnapshot,
    CRITICAL_PRESSURE, WARN_PRESSURE,
};
