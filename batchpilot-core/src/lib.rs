//! batchpilot core library
//!
//! Adaptive micro-batching in front of an expensive inference call: concurrent
//! single requests are grouped into batches, the backend is called once per
//! batch, and results are scattered back to the callers in order. Batch size
//! and accumulation window are recalibrated from observed latency.
//!
//! ```text
//!  callers ──submit──► RequestQueue ──► BatchScheduler ──cut──► Dispatcher ──► InferenceBackend
//!     ▲                 (bounded,       (open batch,           (one call per
//!     │                  QueueFull)      size/time cuts)         batch)
//!     │                                       ▲                     │
//!     │                                       │ thresholds          │ size, wait, latency
//!     │                                 AdaptivePolicy ◄────────────┤
//!     └──────────────── results / errors, positional ◄──────────────┘
//! ```

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod scheduler;

pub use batch::{BatchResult, CutReason, ResponseHandle};
pub use config::BatcherConfig;
pub use dispatcher::{backend_fn, BatchReport, Dispatcher, FnBackend, InferenceBackend};
pub use error::{BatchError, CancelReason, PolicyConfigError};
pub use metrics::{BatcherMetrics, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use policy::{AdaptivePolicy, PolicyState, Thresholds};
