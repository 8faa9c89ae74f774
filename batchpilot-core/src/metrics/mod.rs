//! Metrics module for batchpilot
//!
//! In-process counters for every orchestrator, plus a Prometheus exporter
//! for external monitoring.

mod batcher;
pub mod prometheus;

pub use batcher::{BatcherMetrics, MetricsSnapshot};

// Re-export commonly used items
pub use self::prometheus::{encode_metrics, register_metrics, register_metrics_with, REGISTRY};
