//! Bounded ingress queue with admission control.
//!
//! Producers call [`RequestQueue::submit`], which never blocks: when the
//! queue holds `queue_capacity` requests the submission fails immediately
//! with [`BatchError::QueueFull`]. The single consumer is the scheduler,
//! which owns the [`QueueReceiver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::batch::{Request, ResponseHandle};
use crate::error::BatchError;
use crate::metrics::{prometheus, BatcherMetrics};

/// Create a queue and its consumer half
pub fn bounded<I, O>(
    capacity: usize,
    metrics: Arc<BatcherMetrics>,
) -> (RequestQueue<I, O>, QueueReceiver<I, O>) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    let queue = RequestQueue {
        tx,
        capacity,
        closed: closed.clone(),
        metrics: metrics.clone(),
    };
    let receiver = QueueReceiver { rx, closed, metrics };
    (queue, receiver)
}

/// Producer half: admission control in front of the scheduler
#[derive(Debug)]
pub struct RequestQueue<I, O> {
    tx: mpsc::Sender<Request<I, O>>,
    capacity: usize,
    closed: Arc<AtomicBool>,
    metrics: Arc<BatcherMetrics>,
}

impl<I, O> RequestQueue<I, O> {
    /// Submit a payload; returns the handle the caller awaits
    pub fn submit(
        &self,
        payload: I,
        deadline: Option<Instant>,
    ) -> Result<ResponseHandle<O>, BatchError> {
        let (request, handle) = Request::new(payload, deadline);
        self.enqueue(request)?;
        Ok(handle)
    }

    /// Admit an already built request
    pub fn enqueue(&self, request: Request<I, O>) -> Result<(), BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::ShuttingDown);
        }

        let id = request.id();
        // The slot is counted before the send so the consumer never dequeues
        // a request the depth counter has not seen yet
        let depth = self.metrics.record_queued();
        match self.tx.try_send(request) {
            Ok(()) => {
                self.metrics.record_received();
                self.metrics.record_queue_depth(depth.min(self.capacity as u64));
                prometheus::set_queue_depth(self.metrics.queue_depth());
                tracing::debug!(
                    request_id = id,
                    queue_depth = self.metrics.queue_depth(),
                    "Request enqueued"
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_unqueued();
                self.metrics.record_received();
                self.metrics.record_rejected();
                prometheus::record_rejected();
                tracing::debug!(
                    request_id = id,
                    capacity = self.capacity,
                    "Request rejected, queue full"
                );
                Err(BatchError::QueueFull { capacity: self.capacity })
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_unqueued();
                Err(BatchError::ShuttingDown)
            }
        }
    }

    /// Stop admitting new requests; already queued ones are still drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Get current queue depth
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer half, owned by the scheduler task
#[derive(Debug)]
pub struct QueueReceiver<I, O> {
    rx: mpsc::Receiver<Request<I, O>>,
    closed: Arc<AtomicBool>,
    metrics: Arc<BatcherMetrics>,
}

impl<I, O> QueueReceiver<I, O> {
    /// Wait for the next request; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<Request<I, O>> {
        let request = self.rx.recv().await?;
        self.record_dequeued(&request);
        Some(request)
    }

    /// Take a request if one is immediately available
    pub fn try_recv(&mut self) -> Option<Request<I, O>> {
        let request = self.rx.try_recv().ok()?;
        self.record_dequeued(&request);
        Some(request)
    }

    /// Refuse further submissions while keeping buffered requests
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.rx.close();
    }

    fn record_dequeued(&self, request: &Request<I, O>) {
        let wait = Instant::now().saturating_duration_since(request.arrived_at());
        self.metrics.record_dequeued(wait);
        prometheus::set_queue_depth(self.metrics.queue_depth());
    }
}
