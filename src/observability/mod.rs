// Background instance probing and the gateway health report
pub mod health;

// Structured logging setup
pub mod logging;

// Prometheus recorder and recording helpers
pub mod metrics;

pub use health::{HealthMonitor, HealthReport};
pub use logging::init_tracing;
pub use metrics::install_recorder;
