//! Prometheus metrics for batchpilot
//!
//! Exposes per-batch observations in Prometheus format for external
//! monitoring. Metrics are always recorded; they only become visible once
//! [`register_metrics`] has added them to [`REGISTRY`].

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::dispatcher::BatchReport;
use crate::policy::Thresholds;

lazy_static! {
    /// Global Prometheus registry for batchpilot metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Batch Metrics ==============

    /// Completed batches by cut reason and outcome
    pub static ref BATCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("batches_total", "Total number of dispatched batches")
            .namespace("batchpilot"),
        &["cut", "status"]
    ).expect("metric can be created");

    /// Realized batch size
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_size", "Number of requests per dispatched batch")
            .namespace("batchpilot")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0])
    ).expect("metric can be created");

    /// Accumulation wait per batch
    pub static ref BATCH_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "batch_wait_seconds",
            "Time from the first admitted request to the cut"
        )
        .namespace("batchpilot")
        .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25])
    ).expect("metric can be created");

    /// Inference call latency per batch
    pub static ref DISPATCH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dispatch_latency_seconds",
            "Duration of the inference call for one batch"
        )
        .namespace("batchpilot")
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    ).expect("metric can be created");

    /// Batches queued for dispatch or executing
    pub static ref IN_FLIGHT_BATCHES: Gauge = Gauge::with_opts(
        Opts::new("in_flight_batches", "Batches queued for dispatch or executing")
            .namespace("batchpilot")
    ).expect("metric can be created");

    // ============== Request Metrics ==============

    /// Requests rejected at admission
    pub static ref REQUESTS_REJECTED_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_rejected_total", "Total requests rejected due to queue full")
            .namespace("batchpilot")
    ).expect("metric can be created");

    /// Requests cancelled before their batch was cut
    pub static ref REQUESTS_CANCELLED_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_cancelled_total", "Total requests cancelled before dispatch")
            .namespace("batchpilot")
    ).expect("metric can be created");

    /// Results dropped because the caller had gone away
    pub static ref RESULTS_DISCARDED_TOTAL: Counter = Counter::with_opts(
        Opts::new("results_discarded_total", "Total results discarded after caller cancellation")
            .namespace("batchpilot")
    ).expect("metric can be created");

    /// Current queue depth
    pub static ref QUEUE_DEPTH: Gauge = Gauge::with_opts(
        Opts::new("queue_depth", "Current number of requests waiting for the scheduler")
            .namespace("batchpilot")
    ).expect("metric can be created");

    // ============== Policy Metrics ==============

    /// Current batch size limit
    pub static ref MAX_BATCH_SIZE: Gauge = Gauge::with_opts(
        Opts::new("max_batch_size", "Current adaptive batch size limit")
            .namespace("batchpilot")
    ).expect("metric can be created");

    /// Current accumulation window
    pub static ref MAX_WAIT_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("max_wait_seconds", "Current adaptive accumulation window")
            .namespace("batchpilot")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    register_metrics_with(&REGISTRY)
}

/// Register all metrics with `registry`
pub fn register_metrics_with(registry: &Registry) -> prometheus::Result<()> {
    // Batch metrics
    registry.register(Box::new(BATCHES_TOTAL.clone()))?;
    registry.register(Box::new(BATCH_SIZE.clone()))?;
    registry.register(Box::new(BATCH_WAIT_SECONDS.clone()))?;
    registry.register(Box::new(DISPATCH_LATENCY_SECONDS.clone()))?;
    registry.register(Box::new(IN_FLIGHT_BATCHES.clone()))?;

    // Request metrics
    registry.register(Box::new(REQUESTS_REJECTED_TOTAL.clone()))?;
    registry.register(Box::new(REQUESTS_CANCELLED_TOTAL.clone()))?;
    registry.register(Box::new(RESULTS_DISCARDED_TOTAL.clone()))?;
    registry.register(Box::new(QUEUE_DEPTH.clone()))?;

    // Policy metrics
    registry.register(Box::new(MAX_BATCH_SIZE.clone()))?;
    registry.register(Box::new(MAX_WAIT_SECONDS.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Record a batch whose dispatch finished.
pub fn record_batch(report: &BatchReport) {
    BATCHES_TOTAL
        .with_label_values(&[report.reason.as_str(), report.status_label()])
        .inc();
    BATCH_SIZE.observe(report.size as f64);
    BATCH_WAIT_SECONDS.observe(report.wait_time.as_secs_f64());
    DISPATCH_LATENCY_SECONDS.observe(report.latency.as_secs_f64());
    if report.discarded > 0 {
        RESULTS_DISCARDED_TOTAL.inc_by(report.discarded as f64);
    }
}

/// Record a rejected request.
pub fn record_rejected() {
    REQUESTS_REJECTED_TOTAL.inc();
}

/// Record requests cancelled before dispatch.
pub fn record_cancelled(count: usize) {
    REQUESTS_CANCELLED_TOTAL.inc_by(count as f64);
}

/// Update queue depth gauge.
pub fn set_queue_depth(depth: u64) {
    QUEUE_DEPTH.set(depth as f64);
}

/// Update in-flight batches gauge.
pub fn set_in_flight(batches: u64) {
    IN_FLIGHT_BATCHES.set(batches as f64);
}

/// Publish the current adaptive thresholds.
pub fn set_thresholds(thresholds: Thresholds) {
    MAX_BATCH_SIZE.set(thresholds.max_batch_size as f64);
    MAX_WAIT_SECONDS.set(thresholds.max_wait_time.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::batch::CutReason;

    #[test]
    fn test_register_metrics() {
        let registry = Registry::new();
        register_metrics_with(&registry).unwrap();
        set_queue_depth(3);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        for expected in [
            "batchpilot_batch_size",
            "batchpilot_dispatch_latency_seconds",
            "batchpilot_queue_depth",
            "batchpilot_max_batch_size",
            "batchpilot_requests_rejected_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }

        // Registering the same collectors twice is refused
        assert!(register_metrics_with(&registry).is_err());

        let text = TextEncoder::new().encode_to_string(&registry.gather()).unwrap();
        assert!(text.contains("batchpilot_queue_depth"));
    }

    #[test]
    fn test_record_batch() {
        let report = BatchReport {
            batch_id: 1,
            reason: CutReason::Full,
            size: 4,
            wait_time: Duration::from_millis(3),
            latency: Duration::from_millis(12),
            error: None,
            delivered: 4,
            discarded: 0,
        };
        let before = BATCHES_TOTAL.with_label_values(&["full", "ok"]).get();
        record_batch(&report);
        assert!(BATCHES_TOTAL.with_label_values(&["full", "ok"]).get() > before);
    }

    #[test]
    fn test_set_thresholds() {
        set_thresholds(Thresholds {
            max_batch_size: 16,
            max_wait_time: Duration::from_millis(250),
        });
        // Other tests may publish concurrently; only check the value is sane
        assert!(MAX_BATCH_SIZE.get() >= 1.0);
        assert!(MAX_WAIT_SECONDS.get() >= 0.0);
    }

    #[test]
    fn test_encode_metrics() {
        let output = encode_metrics();
        // Should return something (even if registry not initialized)
        assert!(output.is_empty() || output.starts_with('#') || output.contains("batchpilot"));
    }
}
