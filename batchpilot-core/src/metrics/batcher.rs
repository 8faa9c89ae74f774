//! Lock-free counters for the batcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::batch::CutReason;

/// Metrics for monitoring batcher performance
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Submissions that reached admission control, whether queued or
    /// rejected for a full queue. Refusals during shutdown are not counted.
    pub requests_received: AtomicU64,

    /// Requests currently waiting in the queue
    pub requests_queued: AtomicU64,

    /// Requests rejected due to full queue
    pub requests_rejected: AtomicU64,

    /// Requests removed from an open batch because they were cancelled or expired
    pub requests_cancelled: AtomicU64,

    /// Results delivered to callers
    pub requests_completed: AtomicU64,

    /// Errors delivered to callers because their batch failed
    pub requests_failed: AtomicU64,

    /// Results dropped because the caller cancelled after the cut
    pub results_discarded: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,

    /// Total queue wait time in microseconds (for averaging)
    pub total_queue_wait_us: AtomicU64,

    /// Batches cut because they were full
    pub batches_full: AtomicU64,

    /// Batches cut by the wait-timer
    pub batches_timeout: AtomicU64,

    /// Batches cut by idle flush or shutdown drain
    pub batches_flush: AtomicU64,

    /// Batches currently queued for dispatch or executing
    pub batches_in_flight: AtomicU64,

    /// Batches that finished dispatch (success or failure)
    pub batches_completed: AtomicU64,

    /// Batches whose dispatch failed
    pub batches_failed: AtomicU64,

    /// Total requests in completed batches (for batch size averaging)
    pub total_batch_requests: AtomicU64,

    /// Total accumulation wait of completed batches in microseconds
    pub total_batch_wait_us: AtomicU64,

    /// Total dispatch latency of completed batches in microseconds
    pub total_dispatch_us: AtomicU64,
}

impl BatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission attempt
    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserve a queue slot ahead of the send; returns the resulting depth
    pub fn record_queued(&self) -> u64 {
        self.requests_queued.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Undo [`record_queued`](Self::record_queued) for a send that was refused
    pub fn record_unqueued(&self) {
        self.saturating_dequeue();
    }

    /// Update max queue depth if needed
    pub fn record_queue_depth(&self, depth: u64) {
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while depth > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record a request leaving the queue for the scheduler
    pub fn record_dequeued(&self, wait_time: Duration) {
        self.saturating_dequeue();
        self.total_queue_wait_us
            .fetch_add(wait_time.as_micros() as u64, Ordering::Relaxed);
    }

    fn saturating_dequeue(&self) {
        let _ = self
            .requests_queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Record a request rejected due to full queue
    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record requests pruned from the open batch
    pub fn record_cancelled(&self, count: usize) {
        self.requests_cancelled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a batch being cut and handed to the dispatcher
    pub fn record_cut(&self, reason: CutReason) {
        let counter = match reason {
            CutReason::Full => &self.batches_full,
            CutReason::Timeout => &self.batches_timeout,
            CutReason::Flush => &self.batches_flush,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.batches_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch whose dispatch finished
    pub fn record_batch_finished(
        &self,
        size: usize,
        wait_time: Duration,
        latency: Duration,
        failed: bool,
        delivered: usize,
        discarded: usize,
    ) {
        self.batches_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
            self.requests_failed
                .fetch_add(delivered as u64, Ordering::Relaxed);
        } else {
            self.requests_completed
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
        self.results_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        self.total_batch_requests
            .fetch_add(size as u64, Ordering::Relaxed);
        self.total_batch_wait_us
            .fetch_add(wait_time.as_micros() as u64, Ordering::Relaxed);
        self.total_dispatch_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get current queue depth
    pub fn queue_depth(&self) -> u64 {
        self.requests_queued.load(Ordering::Relaxed)
    }

    /// Get number of batches queued for dispatch or executing
    pub fn in_flight(&self) -> u64 {
        self.batches_in_flight.load(Ordering::Relaxed)
    }

    /// Total batches cut so far
    pub fn batches_cut(&self) -> u64 {
        self.batches_full.load(Ordering::Relaxed)
            + self.batches_timeout.load(Ordering::Relaxed)
            + self.batches_flush.load(Ordering::Relaxed)
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_completed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        let total_requests = self.total_batch_requests.load(Ordering::Relaxed);
        total_requests as f64 / batches as f64
    }

    /// Calculate average accumulation wait in milliseconds
    pub fn avg_batch_wait_ms(&self) -> f64 {
        let batches = self.batches_completed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_wait_us.load(Ordering::Relaxed) as f64 / batches as f64 / 1000.0
    }

    /// Calculate average dispatch latency in milliseconds
    pub fn avg_dispatch_ms(&self) -> f64 {
        let batches = self.batches_completed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_dispatch_us.load(Ordering::Relaxed) as f64 / batches as f64 / 1000.0
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            batches_full: self.batches_full.load(Ordering::Relaxed),
            batches_timeout: self.batches_timeout.load(Ordering::Relaxed),
            batches_flush: self.batches_flush.load(Ordering::Relaxed),
            batches_in_flight: self.batches_in_flight.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            avg_batch_wait_ms: self.avg_batch_wait_ms(),
            avg_dispatch_ms: self.avg_dispatch_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_queued: u64,
    pub requests_rejected: u64,
    pub requests_cancelled: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub results_discarded: u64,
    pub max_queue_depth: u64,
    pub batches_full: u64,
    pub batches_timeout: u64,
    pub batches_flush: u64,
    pub batches_in_flight: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub avg_batch_size: f64,
    pub avg_batch_wait_ms: f64,
    pub avg_dispatch_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_tracking() {
        let metrics = BatcherMetrics::new();

        for _ in 0..5 {
            metrics.record_received();
            let depth = metrics.record_queued();
            metrics.record_queue_depth(depth);
        }
        assert_eq!(metrics.queue_depth(), 5);

        for _ in 0..3 {
            metrics.record_dequeued(Duration::from_millis(2));
        }

        // Max should still be 5
        assert_eq!(metrics.max_queue_depth.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.queue_depth(), 2);
    }

    #[test]
    fn test_queue_depth_never_wraps() {
        let metrics = BatcherMetrics::new();

        metrics.record_dequeued(Duration::ZERO);
        metrics.record_unqueued();
        assert_eq!(metrics.queue_depth(), 0);

        assert_eq!(metrics.record_queued(), 1);
        metrics.record_unqueued();
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.max_queue_depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_batch_lifecycle() {
        let metrics = BatcherMetrics::new();

        metrics.record_cut(CutReason::Full);
        metrics.record_cut(CutReason::Timeout);
        assert_eq!(metrics.in_flight(), 2);
        assert_eq!(metrics.batches_cut(), 2);

        metrics.record_batch_finished(
            4,
            Duration::from_millis(2),
            Duration::from_millis(10),
            false,
            4,
            0,
        );
        metrics.record_batch_finished(
            2,
            Duration::from_millis(6),
            Duration::from_millis(30),
            true,
            1,
            1,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_in_flight, 0);
        assert_eq!(snapshot.batches_completed, 2);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.requests_completed, 4);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.results_discarded, 1);
        assert_eq!(snapshot.avg_batch_size, 3.0);
        assert_eq!(snapshot.avg_batch_wait_ms, 4.0);
        assert_eq!(snapshot.avg_dispatch_ms, 20.0);
    }

    #[test]
    fn test_empty_averages() {
        let metrics = BatcherMetrics::new();
        assert_eq!(metrics.avg_batch_size(), 0.0);
        assert_eq!(metrics.avg_batch_wait_ms(), 0.0);
        assert_eq!(metrics.avg_dispatch_ms(), 0.0);
    }
}
