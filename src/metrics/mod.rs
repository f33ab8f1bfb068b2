//! Metrics and health monitoring for the live match service

pub mod collector;
pub mod health;

// Re-export commonly used types
pub use collector::{MetricsCollector, MetricsTimer};
pub use health::{HealthServer, HealthServerConfig};
