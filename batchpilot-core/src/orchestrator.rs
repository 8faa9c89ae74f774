//! Orchestrator: wires queue, scheduler, dispatcher and policy for one
//! batching endpoint.
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::start(BatcherConfig::default(), backend)?;
//! let embedding = orchestrator.call(prompt).await?;
//! orchestrator.shutdown().await;
//! ```
//!
//! Handles are cheap to clone. Dropping the last handle drains the endpoint
//! in the background, like [`Orchestrator::shutdown`] without the wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::batch::{CutBatch, ResponseHandle};
use crate::config::BatcherConfig;
use crate::dispatcher::{BatchReport, Dispatcher, InferenceBackend};
use crate::error::{BatchError, PolicyConfigError};
use crate::metrics::{prometheus, BatcherMetrics, MetricsSnapshot};
use crate::policy::{AdaptivePolicy, PolicyState, SharedPolicy, Thresholds};
use crate::queue::{self, RequestQueue};
use crate::scheduler::{Accumulator, BatchScheduler};

/// Buffered reports per subscriber before it starts lagging
const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running batching endpoint
pub struct Orchestrator<I, O> {
    inner: Arc<Inner<I, O>>,
}

impl<I, O> Clone for Orchestrator<I, O> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct Inner<I, O> {
    config: BatcherConfig,
    queue: RequestQueue<I, O>,
    policy: Arc<SharedPolicy>,
    metrics: Arc<BatcherMetrics>,
    in_flight: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    reports: broadcast::Sender<BatchReport>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl<I, O> Orchestrator<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Validate the configuration and spawn the scheduler task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<B>(config: BatcherConfig, backend: B) -> Result<Self, PolicyConfigError>
    where
        B: InferenceBackend<I, O>,
    {
        config.validate()?;

        let metrics = Arc::new(BatcherMetrics::new());
        let policy = Arc::new(SharedPolicy::new(AdaptivePolicy::new(&config)));
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight_batches));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let (queue, receiver) = queue::bounded(config.queue_capacity, metrics.clone());

        prometheus::set_thresholds(policy.thresholds());

        let scheduler = BatchScheduler::new(
            Accumulator::new(config.min_batch_size, config.idle_flush),
            receiver,
            policy.clone(),
            in_flight.clone(),
            shutdown_rx,
            metrics.clone(),
        );
        let handoff = dispatch_handoff(
            Dispatcher::new(backend),
            policy.clone(),
            metrics.clone(),
            reports.clone(),
        );
        let task = tokio::spawn(scheduler.run(handoff));

        info!(
            max_batch_size = config.max_batch_size,
            max_wait_ms = config.max_wait_time.as_millis() as u64,
            target_latency_ms = config.target_latency.as_millis() as u64,
            max_in_flight = config.max_in_flight_batches,
            queue_capacity = config.queue_capacity,
            adaptive = config.adaptive,
            "Batcher started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                queue,
                policy,
                metrics,
                in_flight,
                shutdown,
                reports,
                scheduler: Mutex::new(Some(task)),
            }),
        })
    }
}

impl<I, O> Orchestrator<I, O> {
    /// Submit a request; never blocks
    pub fn submit(&self, payload: I) -> Result<ResponseHandle<O>, BatchError> {
        self.inner.queue.submit(payload, None)
    }

    /// Submit a request that is cancelled if unresolved at `deadline`
    pub fn submit_with_deadline(
        &self,
        payload: I,
        deadline: Instant,
    ) -> Result<ResponseHandle<O>, BatchError> {
        self.inner.queue.submit(payload, Some(deadline))
    }

    pub fn submit_with_timeout(
        &self,
        payload: I,
        timeout: Duration,
    ) -> Result<ResponseHandle<O>, BatchError> {
        self.submit_with_deadline(payload, Instant::now() + timeout)
    }

    /// Submit and wait for the result
    pub async fn call(&self, payload: I) -> Result<O, BatchError> {
        self.submit(payload)?.recv().await
    }

    /// Thresholds that apply to the next opened batch
    pub fn thresholds(&self) -> Thresholds {
        self.inner.policy.thresholds()
    }

    pub fn policy_state(&self) -> PolicyState {
        self.inner.policy.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Stream of per-batch reports
    pub fn subscribe(&self) -> broadcast::Receiver<BatchReport> {
        self.inner.reports.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Stop admission, drain admitted requests and wait for every dispatch
    ///
    /// Idempotent; concurrent callers all return once the drain is complete.
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        self.inner.shutdown.send_replace(true);

        let mut scheduler = self.inner.scheduler.lock().await;
        if let Some(task) = scheduler.take() {
            info!(queued = self.inner.metrics.queue_depth(), "Batcher shutting down");
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        // `validate` bounds max_in_flight_batches by MAX_IN_FLIGHT, which fits a u32
        let permits = u32::try_from(self.inner.config.max_in_flight_batches).unwrap_or(u32::MAX);
        match self.inner.in_flight.acquire_many(permits).await {
            Ok(all) => drop(all),
            Err(_) => warn!("In-flight semaphore closed during shutdown"),
        }
        drop(scheduler);

        info!("Batcher stopped");
    }
}

fn dispatch_handoff<I, O, B>(
    dispatcher: Dispatcher<B>,
    policy: Arc<SharedPolicy>,
    metrics: Arc<BatcherMetrics>,
    reports: broadcast::Sender<BatchReport>,
) -> impl FnMut(CutBatch<I, O>, OwnedSemaphorePermit) + Send + 'static
where
    I: Send + 'static,
    O: Send + 'static,
    B: InferenceBackend<I, O>,
{
    move |batch, permit| {
        let dispatcher = dispatcher.clone();
        let policy = policy.clone();
        let metrics = metrics.clone();
        let reports = reports.clone();

        tokio::spawn(async move {
            let report = dispatcher.dispatch(batch).await;
            record_report(&report, &policy, &metrics);
            // No subscribers is fine
            let _ = reports.send(report);
            drop(permit);
        });
    }
}

fn record_report(report: &BatchReport, policy: &SharedPolicy, metrics: &BatcherMetrics) {
    // Failed batches say nothing about the latency of a healthy call
    if report.is_success() && report.size > 0 {
        let thresholds = policy.observe(report.size, report.wait_time, report.latency);
        prometheus::set_thresholds(thresholds);
    }

    metrics.record_batch_finished(
        report.size,
        report.wait_time,
        report.latency,
        !report.is_success(),
        report.delivered,
        report.discarded,
    );
    prometheus::record_batch(report);
    prometheus::set_in_flight(metrics.in_flight());
}
