pub mod guard;
pub mod probe;
pub mod types;

pub use guard::{classify, Recommendation, ThermalGuard, ThermalGuardConfig, ThermalStats};
pub use probe::{
    default_probes, ComponentsProbe, PowerMonitorProbe, ProbeError, SysfsProbe, ThermalProbe,
};
pub use types::{
    ResourceState, TemperatureHistory, ThermalReading, ThermalState, ThermalStatus, ThermalTrend,
};
