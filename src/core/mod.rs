pub mod circuit_breaker;
pub mod config;
pub mod connection_pool;
pub mod error;
pub mod types;
