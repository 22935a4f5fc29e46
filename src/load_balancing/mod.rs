pub mod balancer;

pub use balancer::{
    create_load_balancer, InstanceSelector, LoadBalancer, RoundRobinBalancer,
    WeightedLatencyBalancer,
};
