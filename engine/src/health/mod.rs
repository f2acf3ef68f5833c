//! App health checking

pub mod monitor;
pub mod probe;
pub mod registry;

pub use monitor::{HealthMonitor, HealthReport, MonitorOptions};
pub use registry::{CheckStatus, HealthRecord, HealthRegistry};
