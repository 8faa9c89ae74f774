//! Batch dispatcher
//!
//! Runs one cut batch through the inference backend and resolves every
//! completion slot: outputs are scattered by position on success, and a
//! failure is broadcast identically to all requests of the batch.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batch::{BatchResult, CutBatch, CutReason, Delivery};
use crate::error::BatchError;

/// The expensive call being batched
///
/// Must return exactly one output per input, in input order.
pub trait InferenceBackend<I, O>: Send + Sync + 'static {
    fn infer(&self, inputs: Vec<I>) -> impl Future<Output = anyhow::Result<Vec<O>>> + Send;
}

impl<I, O, B> InferenceBackend<I, O> for Arc<B>
where
    B: InferenceBackend<I, O>,
{
    fn infer(&self, inputs: Vec<I>) -> impl Future<Output = anyhow::Result<Vec<O>>> + Send {
        (**self).infer(inputs)
    }
}

/// Backend built from an async closure, see [`backend_fn`]
#[derive(Clone)]
pub struct FnBackend<F> {
    f: F,
}

/// Wrap an async closure as an [`InferenceBackend`]
///
/// ```rust,ignore
/// let backend = backend_fn(|prompts: Vec<String>| async move {
///     Ok(prompts.into_iter().map(|p| p.len()).collect())
/// });
/// ```
pub fn backend_fn<F>(f: F) -> FnBackend<F> {
    FnBackend { f }
}

impl<I, O, F, Fut> InferenceBackend<I, O> for FnBackend<F>
where
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<O>>> + Send,
{
    fn infer(&self, inputs: Vec<I>) -> impl Future<Output = anyhow::Result<Vec<O>>> + Send {
        (self.f)(inputs)
    }
}

/// Outcome of one dispatched batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: u64,
    pub reason: CutReason,
    /// Requests handed to the backend
    pub size: usize,
    /// Accumulation time, from the first admitted request to the cut
    #[serde(rename = "wait_ms", serialize_with = "serialize_ms")]
    pub wait_time: Duration,
    /// Duration of the backend call
    #[serde(rename = "latency_ms", serialize_with = "serialize_ms")]
    pub latency: Duration,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<BatchError>,
    /// Results (or errors) that reached their caller
    pub delivered: usize,
    /// Results dropped because the caller cancelled after the cut
    pub discarded: usize,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Label for the `status` dimension of batch metrics
    pub fn status_label(&self) -> &'static str {
        self.error.as_ref().map_or("ok", BatchError::kind)
    }

    /// Wait plus dispatch latency, the quantity the policy steers
    pub fn end_to_end(&self) -> Duration {
        self.wait_time + self.latency
    }
}

fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_micros() as f64 / 1000.0)
}

fn serialize_error<S: Serializer>(e: &Option<BatchError>, s: S) -> Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// Executes cut batches against an inference backend
pub struct Dispatcher<B> {
    backend: Arc<B>,
}

impl<B> Clone for Dispatcher<B> {
    fn clone(&self) -> Self {
        Self { backend: self.backend.clone() }
    }
}

impl<B> Dispatcher<B> {
    pub fn new(backend: B) -> Self {
        Self { backend: Arc::new(backend) }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Invoke the backend once and validate its outputs
    ///
    /// Errors and panics of the backend become [`BatchError::BatchDispatch`].
    pub async fn execute<I, O>(&self, inputs: Vec<I>) -> Result<BatchResult<O>, BatchError>
    where
        B: InferenceBackend<I, O>,
    {
        let expected = inputs.len();
        let backend: &B = &self.backend;
        let call = async move { backend.infer(inputs).await };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(outputs)) => BatchResult::new(expected, outputs),
            Ok(Err(e)) => Err(BatchError::dispatch(format!("{e:#}"))),
            Err(panic) => Err(BatchError::dispatch(format!(
                "inference backend panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Execute a cut batch and resolve every request in it
    pub async fn dispatch<I, O>(&self, batch: CutBatch<I, O>) -> BatchReport
    where
        B: InferenceBackend<I, O>,
    {
        let batch_id = batch.id();
        let reason = batch.reason();
        let wait_time = batch.wait_time();
        let (inputs, completions) = batch.into_parts();
        let size = inputs.len();

        let mut report = BatchReport {
            batch_id,
            reason,
            size,
            wait_time,
            latency: Duration::ZERO,
            error: None,
            delivered: 0,
            discarded: 0,
        };
        if inputs.is_empty() {
            return report;
        }

        let started = Instant::now();
        let result = self.execute(inputs).await;
        report.latency = started.elapsed();

        let now = Instant::now();
        let deliveries: Vec<Delivery> = match result {
            Ok(result) => completions
                .into_iter()
                .zip(result.into_outputs())
                .map(|(completion, output)| completion.resolve(Ok(output), now))
                .collect(),
            Err(err) => {
                warn!(
                    batch_id,
                    size,
                    error = %err,
                    "Batch dispatch failed"
                );
                let deliveries = completions
                    .into_iter()
                    .map(|completion| completion.resolve(Err(err.clone()), now))
                    .collect();
                report.error = Some(err);
                deliveries
            }
        };

        report.delivered = deliveries.iter().filter(|d| **d == Delivery::Delivered).count();
        report.discarded = deliveries.len() - report.delivered;

        debug!(
            batch_id,
            reason = %reason,
            size,
            wait_us = wait_time.as_micros() as u64,
            latency_us = report.latency.as_micros() as u64,
            delivered = report.delivered,
            discarded = report.discarded,
            "Batch dispatched"
        );
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, Request, ResponseHandle};
    use crate::error::CancelReason;
    use crate::policy::Thresholds;

    struct CrashingBackend;

    impl InferenceBackend<u32, u32> for CrashingBackend {
        async fn infer(&self, _inputs: Vec<u32>) -> anyhow::Result<Vec<u32>> {
            panic!("model crashed")
        }
    }

    fn cut_batch(payloads: &[u32]) -> (CutBatch<u32, u32>, Vec<ResponseHandle<u32>>) {
        let now = Instant::now();
        let limits = Thresholds { max_batch_size: 16, max_wait_time: Duration::from_millis(10) };
        let mut handles = Vec::new();
        let mut batch: Option<Batch<u32, u32>> = None;

        for &payload in payloads {
            let (request, handle) = Request::new(payload, None);
            handles.push(handle);
            match batch.as_mut() {
                Some(batch) => batch.push(request).unwrap(),
                None => batch = Some(Batch::open(1, request, now, limits)),
            }
        }
        (batch.unwrap().cut(CutReason::Timeout, now), handles)
    }

    fn doubling() -> Dispatcher<impl InferenceBackend<u32, u32>> {
        Dispatcher::new(backend_fn(|inputs: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(inputs.into_iter().map(|x| x * 2).collect())
        }))
    }

    #[tokio::test]
    async fn test_outputs_scattered_by_position() {
        let (batch, handles) = cut_batch(&[1, 2, 3]);
        let report = doubling().dispatch(batch).await;

        assert!(report.is_success());
        assert_eq!(report.status_label(), "ok");
        assert_eq!(report.size, 3);
        assert_eq!(report.delivered, 3);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.recv().await.unwrap());
        }
        assert_eq!(results, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_whole_batch() {
        let dispatcher = Dispatcher::new(backend_fn(|_: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(vec![1u32, 2])
        }));
        let (batch, handles) = cut_batch(&[1, 2, 3]);
        let report = dispatcher.dispatch(batch).await;

        let expected = BatchError::BatchSizeMismatch { expected: 3, actual: 2 };
        assert_eq!(report.error, Some(expected.clone()));
        assert_eq!(report.status_label(), "size_mismatch");
        for handle in handles {
            assert_eq!(handle.recv().await, Err(expected.clone()));
        }
    }

    #[tokio::test]
    async fn test_backend_error_broadcast() {
        let dispatcher = Dispatcher::new(backend_fn(|_: Vec<u32>| async move {
            Err::<Vec<u32>, _>(anyhow::anyhow!("device out of memory"))
        }));
        let (batch, handles) = cut_batch(&[1, 2]);
        let report = dispatcher.dispatch(batch).await;

        assert_eq!(report.delivered, 2);
        for handle in handles {
            let err = handle.recv().await.unwrap_err();
            assert!(err.is_batch_failure());
            assert!(err.to_string().contains("device out of memory"));
        }
    }

    #[tokio::test]
    async fn test_backend_panic_becomes_dispatch_error() {
        let dispatcher = Dispatcher::new(CrashingBackend);
        let (batch, handles) = cut_batch(&[1, 2]);
        let report = dispatcher.dispatch(batch).await;

        assert_eq!(report.status_label(), "dispatch_error");
        for handle in handles {
            let err = handle.recv().await.unwrap_err();
            assert!(err.to_string().contains("model crashed"));
        }
    }

    #[tokio::test]
    async fn test_result_discarded_after_cancel() {
        let (batch, mut handles) = cut_batch(&[1, 2]);
        let cancelled = handles.remove(0);
        cancelled.cancel();

        let report = doubling().dispatch(batch).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.discarded, 1);

        assert_eq!(
            cancelled.recv().await,
            Err(BatchError::cancelled(CancelReason::Caller))
        );
        assert_eq!(handles.remove(0).recv().await, Ok(4));
    }

    #[tokio::test]
    async fn test_execute_empty_input() {
        let result = doubling().execute(Vec::new()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_shared_backend() {
        let backend = Arc::new(backend_fn(|inputs: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(inputs)
        }));
        let first = Dispatcher::new(backend.clone());
        let second = Dispatcher::new(backend);

        let out = first.execute::<u32, u32>(vec![1, 2]).await.unwrap();
        assert_eq!(out.into_outputs(), vec![1, 2]);
        let out = second.execute::<u32, u32>(vec![3]).await.unwrap();
        assert_eq!(out.into_outputs(), vec![3]);
    }

    #[test]
    fn test_report_serialization() {
        let report = BatchReport {
            batch_id: 3,
            reason: CutReason::Flush,
            size: 2,
            wait_time: Duration::from_millis(4),
            latency: Duration::from_millis(6),
            error: Some(BatchError::dispatch("boom")),
            delivered: 2,
            discarded: 0,
        };
        assert_eq!(report.end_to_end(), Duration::from_millis(10));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["reason"], "flush");
        assert_eq!(json["wait_ms"], 4.0);
        assert_eq!(json["error"], "Batch dispatch failed: boom");
    }
}
