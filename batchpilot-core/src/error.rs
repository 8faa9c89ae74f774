//! Error types for the batchpilot core library
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! BatchError            - Per-request failures, delivered through the completion slot
//! ├── QueueFull         - Admission rejected (transient, retry with backoff)
//! ├── RequestCancelled  - Caller cancel or deadline (terminal)
//! ├── BatchDispatch     - Inference backend failed for the whole batch
//! ├── BatchSizeMismatch - Backend returned the wrong number of outputs
//! └── ShuttingDown      - Orchestrator no longer accepts work
//!
//! PolicyConfigError     - Invalid configuration, raised only at startup
//! ```
//!
//! `BatchError` is `Clone` so that a single batch failure can be broadcast
//! identically to every request of the batch.
//!
//! Application code (backends, binaries) should use `anyhow` with context:
//!
//! ```rust,ignore
//! use anyhow::Context;
//!
//! let config = BatcherConfig::from_json_file(path)
//!     .context("Failed to load batcher configuration")?;
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a request was cancelled before producing a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled (explicitly or by dropping its handle)
    Caller,
    /// The request deadline passed before a result was delivered
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors delivered to individual callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Admission rejected because the queue (or the in-flight budget) is exhausted
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    /// The request was cancelled and will never produce a result
    #[error("Request cancelled: {reason}")]
    RequestCancelled { reason: CancelReason },

    /// The inference backend failed for the whole batch
    #[error("Batch dispatch failed: {message}")]
    BatchDispatch { message: String },

    /// The inference backend broke the one-output-per-input contract
    #[error("Inference backend returned {actual} outputs for {expected} inputs")]
    BatchSizeMismatch { expected: usize, actual: usize },

    /// The orchestrator is shutting down and no longer accepts requests
    #[error("Batcher is shutting down")]
    ShuttingDown,
}

impl BatchError {
    /// Create a dispatch error from any displayable failure
    pub fn dispatch(msg: impl fmt::Display) -> Self {
        Self::BatchDispatch { message: msg.to_string() }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: CancelReason) -> Self {
        Self::RequestCancelled { reason }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::QueueFull { .. })
    }

    /// Whether the error originated in a batch-wide dispatch failure
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self,
            BatchError::BatchDispatch { .. } | BatchError::BatchSizeMismatch { .. }
        )
    }

    /// Short stable label, used for metric labels and reports
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::QueueFull { .. } => "queue_full",
            BatchError::RequestCancelled { .. } => "cancelled",
            BatchError::BatchDispatch { .. } => "dispatch_error",
            BatchError::BatchSizeMismatch { .. } => "size_mismatch",
            BatchError::ShuttingDown => "shutting_down",
        }
    }
}

/// Invalid batching configuration, detected before the orchestrator starts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyConfigError {
    /// A batch must hold at least one request
    #[error("min_batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("min_batch_size ({min}) exceeds max_batch_size ({max})")]
    BatchSizeBounds { min: usize, max: usize },

    #[error("min_wait_time ({min:?}) exceeds max_wait_time ({max:?})")]
    WaitTimeBounds { min: Duration, max: Duration },

    #[error("target_latency must be greater than zero")]
    ZeroTargetLatency,

    #[error("max_in_flight_batches must be at least 1")]
    ZeroInFlight,

    #[error("queue_capacity must be at least 1")]
    ZeroQueueCapacity,

    /// A count is larger than the runtime can represent
    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        max: usize,
        value: usize,
    },

    /// A tuning coefficient is outside its allowed range
    #[error("{name} must be within {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },

    /// Configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::QueueFull { capacity: 8 };
        assert_eq!(err.to_string(), "Queue is full (capacity: 8)");

        let err = BatchError::BatchSizeMismatch { expected: 4, actual: 3 };
        assert_eq!(err.to_string(), "Inference backend returned 3 outputs for 4 inputs");

        let err = BatchError::cancelled(CancelReason::DeadlineExceeded);
        assert_eq!(err.to_string(), "Request cancelled: deadline exceeded");
    }

    #[test]
    fn test_batch_error_classification() {
        assert!(BatchError::QueueFull { capacity: 1 }.is_retryable());
        assert!(!BatchError::ShuttingDown.is_retryable());
        assert!(!BatchError::cancelled(CancelReason::Caller).is_retryable());

        assert!(BatchError::dispatch("boom").is_batch_failure());
        assert!(BatchError::BatchSizeMismatch { expected: 2, actual: 1 }.is_batch_failure());
        assert!(!BatchError::QueueFull { capacity: 1 }.is_batch_failure());
    }

    #[test]
    fn test_broadcast_errors_compare_equal() {
        let err = BatchError::dispatch("backend exploded");
        let copies: Vec<BatchError> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| *e == err));
    }

    #[test]
    fn test_config_error_display() {
        let err = PolicyConfigError::BatchSizeBounds { min: 8, max: 4 };
        assert_eq!(err.to_string(), "min_batch_size (8) exceeds max_batch_size (4)");

        let err = PolicyConfigError::OutOfRange {
            name: "smoothing",
            range: "(0, 1]",
            value: 1.5,
        };
        assert_eq!(err.to_string(), "smoothing must be within (0, 1], got 1.5");
    }
}
