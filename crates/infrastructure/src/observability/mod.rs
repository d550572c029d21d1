//! Observability module
//!
//! - Metrics collection through the `metrics` facade
//! - Event-tagged structured logging

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
