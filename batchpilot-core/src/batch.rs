//! Requests, completion slots and batches.
//!
//! A [`Request`] carries its payload together with a single-assignment
//! completion slot. The slot is consumed by value when resolved, so a request
//! can be resolved at most once; dropping an unresolved slot wakes the caller
//! with an error instead of leaving it hanging.
//!
//! A [`Batch`] is the open accumulation buffer owned by the scheduler. Cutting
//! it produces an immutable [`CutBatch`] that is handed to the dispatcher.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BatchError, CancelReason};
use crate::policy::Thresholds;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

type Slot<O> = oneshot::Sender<Result<O, BatchError>>;

/// A single caller request waiting to be batched
pub struct Request<I, O> {
    id: u64,
    payload: I,
    arrived_at: Instant,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    slot: Slot<O>,
}

impl<I, O> Request<I, O> {
    /// Create a request and the handle its caller awaits
    pub fn new(payload: I, deadline: Option<Instant>) -> (Self, ResponseHandle<O>) {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let request = Self {
            id,
            payload,
            arrived_at: Instant::now(),
            deadline,
            cancelled: cancelled.clone(),
            slot: tx,
        };
        let handle = ResponseHandle { id, rx: Some(rx), cancelled, deadline };
        (request, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &I {
        &self.payload
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why this request should no longer be dispatched, if at all
    pub fn cancel_reason(&self, now: Instant) -> Option<CancelReason> {
        cancel_reason(&self.cancelled, self.deadline, now)
    }

    pub fn is_cancelled(&self, now: Instant) -> bool {
        self.cancel_reason(now).is_some()
    }

    /// Resolve the completion slot; returns whether the caller received it
    pub fn resolve(self, result: Result<O, BatchError>) -> bool {
        self.slot.send(result).is_ok()
    }

    /// Split into the payload and the completion slot
    pub fn into_parts(self) -> (I, Completion<O>) {
        let completion = Completion {
            id: self.id,
            deadline: self.deadline,
            cancelled: self.cancelled,
            slot: self.slot,
        };
        (self.payload, completion)
    }
}

impl<I, O> fmt::Debug for Request<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("arrived_at", &self.arrived_at)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

fn cancel_reason(
    cancelled: &AtomicBool,
    deadline: Option<Instant>,
    now: Instant,
) -> Option<CancelReason> {
    if cancelled.load(Ordering::Acquire) {
        Some(CancelReason::Caller)
    } else if deadline.is_some_and(|d| now >= d) {
        Some(CancelReason::DeadlineExceeded)
    } else {
        None
    }
}

/// What happened to a result handed to a completion slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The caller cancelled, timed out or went away; the result was dropped
    Discarded,
}

/// Completion slot of a request that has been handed to the dispatcher
pub struct Completion<O> {
    id: u64,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    slot: Slot<O>,
}

impl<O> Completion<O> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a result unless the request was cancelled in the meantime
    pub fn resolve(self, result: Result<O, BatchError>, now: Instant) -> Delivery {
        if cancel_reason(&self.cancelled, self.deadline, now).is_some() {
            return Delivery::Discarded;
        }
        match self.slot.send(result) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Discarded,
        }
    }
}

impl<O> fmt::Debug for Completion<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// Caller side of a submitted request
///
/// Dropping the handle before the result arrives cancels the request.
#[derive(Debug)]
pub struct ResponseHandle<O> {
    id: u64,
    rx: Option<oneshot::Receiver<Result<O, BatchError>>>,
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl<O> ResponseHandle<O> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the request; a later [`recv`](Self::recv) reports the cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wait for the result, honouring the request deadline
    pub async fn recv(mut self) -> Result<O, BatchError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(BatchError::cancelled(CancelReason::Caller));
        };

        let received = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.cancelled.store(true, Ordering::Release);
                    return Err(BatchError::cancelled(CancelReason::DeadlineExceeded));
                }
            },
            None => (&mut rx).await,
        };

        match received {
            Ok(result) => result,
            Err(_) => Err(self.dropped_error()),
        }
    }

    fn dropped_error(&self) -> BatchError {
        if self.cancelled.load(Ordering::Acquire) {
            BatchError::cancelled(CancelReason::Caller)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            BatchError::cancelled(CancelReason::DeadlineExceeded)
        } else {
            BatchError::ShuttingDown
        }
    }
}

impl<O> Drop for ResponseHandle<O> {
    fn drop(&mut self) {
        // Still waiting: nobody will consume the result any more
        if self.rx.is_some() {
            self.cancelled.store(true, Ordering::Release);
        }
    }
}

/// Why an accumulating batch was cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutReason {
    /// Size reached `max_batch_size`
    Full,
    /// The wait-timer fired
    Timeout,
    /// Idle grace period elapsed, or the orchestrator is draining
    Flush,
}

impl CutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CutReason::Full => "full",
            CutReason::Timeout => "timeout",
            CutReason::Flush => "flush",
        }
    }
}

impl fmt::Display for CutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The open batch, mutated only by the scheduler
#[derive(Debug)]
pub struct Batch<I, O> {
    id: u64,
    requests: Vec<Request<I, O>>,
    created_at: Instant,
    limits: Thresholds,
}

impl<I, O> Batch<I, O> {
    /// Open a batch around its first request
    pub fn open(id: u64, first: Request<I, O>, now: Instant, limits: Thresholds) -> Self {
        let mut requests = Vec::with_capacity(limits.max_batch_size);
        requests.push(first);
        Self { id, requests, created_at: now, limits }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Thresholds captured when the batch was opened
    pub fn limits(&self) -> Thresholds {
        self.limits
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.limits.max_batch_size
    }

    /// When the wait-timer of this batch fires
    pub fn timeout_at(&self) -> Instant {
        self.created_at + self.limits.max_wait_time
    }

    /// Append a request; a full batch hands it back
    pub fn push(&mut self, request: Request<I, O>) -> Result<(), Request<I, O>> {
        if self.is_full() {
            return Err(request);
        }
        self.requests.push(request);
        Ok(())
    }

    /// Remove cancelled or expired requests, resolving each with its
    /// cancellation error; returns how many were removed
    pub fn prune_cancelled(&mut self, now: Instant) -> usize {
        let before = self.requests.len();
        let mut kept = Vec::with_capacity(before);
        for request in self.requests.drain(..) {
            match request.cancel_reason(now) {
                Some(reason) => {
                    request.resolve(Err(BatchError::cancelled(reason)));
                }
                None => kept.push(request),
            }
        }
        self.requests = kept;
        before - self.requests.len()
    }

    /// Finalize the batch
    pub fn cut(self, reason: CutReason, now: Instant) -> CutBatch<I, O> {
        CutBatch {
            id: self.id,
            requests: self.requests,
            created_at: self.created_at,
            cut_at: now,
            reason,
            limits: self.limits,
        }
    }
}

/// A finalized batch; immutable from here on
#[derive(Debug)]
pub struct CutBatch<I, O> {
    id: u64,
    requests: Vec<Request<I, O>>,
    created_at: Instant,
    cut_at: Instant,
    reason: CutReason,
    limits: Thresholds,
}

impl<I, O> CutBatch<I, O> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn reason(&self) -> CutReason {
        self.reason
    }

    pub fn limits(&self) -> Thresholds {
        self.limits
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn cut_at(&self) -> Instant {
        self.cut_at
    }

    /// Time spent accumulating, from the first admitted request to the cut
    pub fn wait_time(&self) -> Duration {
        self.cut_at.saturating_duration_since(self.created_at)
    }

    pub fn requests(&self) -> &[Request<I, O>] {
        &self.requests
    }

    /// Ordered payloads and their completion slots
    pub fn into_parts(self) -> (Vec<I>, Vec<Completion<O>>) {
        self.requests.into_iter().map(Request::into_parts).unzip()
    }
}

/// Backend outputs validated against the batch they answer
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<O> {
    outputs: Vec<O>,
}

impl<O> BatchResult<O> {
    /// Check the one-output-per-input contract
    pub fn new(expected: usize, outputs: Vec<O>) -> Result<Self, BatchError> {
        if outputs.len() != expected {
            return Err(BatchError::BatchSizeMismatch { expected, actual: outputs.len() });
        }
        Ok(Self { outputs })
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn into_outputs(self) -> Vec<O> {
        self.outputs
    }
}
