pub mod registry;

pub use registry::{
    InstanceHealth, InstanceMetrics, InstanceSnapshot, InstanceStatus, ProbeReport,
    ServiceInstance, ServiceRegistry,
};
