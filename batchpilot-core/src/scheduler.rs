//! Batch scheduler
//!
//! Decides when the accumulating batch is cut and handed off for execution.
//!
//! # State machine
//!
//! ```text
//!            request admitted              size == max_batch_size
//!   ┌───────┐ ───────────────► ┌──────────────┐ ─────────────────► ┌─────────────┐
//!   │ Empty │                  │ Accumulating │   wait-timer fired  │ Dispatching │
//!   └───────┘ ◄─────────────── └──────────────┘ ─────────────────► └─────────────┘
//!       ▲      all cancelled                      idle flush              │
//!       └─────────────────────────────────────────────────────────────────┘
//!                                 handed to dispatcher
//! ```
//!
//! `ShuttingDown` replaces `Empty` once a drain was requested: buffered
//! requests are still batched, and the remainder is flushed when the queue
//! runs dry.
//!
//! The decisions live in [`Accumulator`], which takes an explicit `now` so it
//! can be driven deterministically. [`BatchScheduler::run`] is the async loop
//! around it: it owns the queue receiver, so the open batch is only ever
//! touched by one task.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batch::{Batch, CutBatch, CutReason, Request};
use crate::error::BatchError;
use crate::metrics::{prometheus, BatcherMetrics};
use crate::policy::{SharedPolicy, Thresholds};
use crate::queue::QueueReceiver;

/// State of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No open batch
    Empty,
    /// A batch is open and collecting requests
    Accumulating,
    /// A batch was cut and waits to be handed to the dispatcher
    Dispatching,
    /// Draining: no new admissions, remaining requests are flushed
    ShuttingDown,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Empty => write!(f, "Empty"),
            SchedulerState::Accumulating => write!(f, "Accumulating"),
            SchedulerState::Dispatching => write!(f, "Dispatching"),
            SchedulerState::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Synchronous batching decisions
#[derive(Debug)]
pub struct Accumulator<I, O> {
    open: Option<Batch<I, O>>,
    state: SchedulerState,
    draining: bool,
    next_batch_id: u64,
    min_batch_size: usize,
    idle_flush: Option<Duration>,
    last_arrival: Option<Instant>,
    pruned: usize,
}

impl<I, O> Accumulator<I, O> {
    pub fn new(min_batch_size: usize, idle_flush: Option<Duration>) -> Self {
        Self {
            open: None,
            state: SchedulerState::Empty,
            draining: false,
            next_batch_id: 1,
            min_batch_size,
            idle_flush,
            last_arrival: None,
            pruned: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Size of the open batch
    pub fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, Batch::len)
    }

    /// Requests pruned as cancelled since the last call
    pub fn take_pruned(&mut self) -> usize {
        std::mem::take(&mut self.pruned)
    }

    /// Add an admitted request; returns a batch if this arrival completed one
    ///
    /// `limits` only applies when the request opens a new batch; an open
    /// batch keeps the thresholds it was opened with.
    pub fn offer(
        &mut self,
        request: Request<I, O>,
        now: Instant,
        limits: Thresholds,
    ) -> Option<CutBatch<I, O>> {
        if let Some(reason) = request.cancel_reason(now) {
            request.resolve(Err(BatchError::cancelled(reason)));
            self.pruned += 1;
            return None;
        }
        self.last_arrival = Some(now);

        let request = match self.open.as_mut() {
            Some(batch) => {
                self.pruned += batch.prune_cancelled(now);
                if batch.is_empty() {
                    self.open = None;
                    Some(request)
                } else {
                    batch.push(request).err()
                }
            }
            None => Some(request),
        };

        if let Some(request) = request {
            if self.open.is_some() {
                // The open batch was already at its limit; cut it and start over
                let cut = self.cut(CutReason::Full, now);
                self.open_batch(request, now, limits);
                return cut;
            }
            self.open_batch(request, now, limits);
        }

        if self.open.as_ref().is_some_and(Batch::is_full) {
            return self.cut(CutReason::Full, now);
        }
        None
    }

    /// Re-evaluate the open batch at `now`; size takes precedence over time
    pub fn poll(&mut self, now: Instant) -> Option<CutBatch<I, O>> {
        let batch = self.open.as_mut()?;
        self.pruned += batch.prune_cancelled(now);

        if batch.is_empty() {
            debug!(batch_id = batch.id(), "Discarding batch, all requests cancelled");
            self.open = None;
            self.state = self.idle_state();
            return None;
        }
        if batch.is_full() {
            return self.cut(CutReason::Full, now);
        }
        if now >= batch.timeout_at() {
            return self.cut(CutReason::Timeout, now);
        }
        if let (Some(grace), Some(last)) = (self.idle_flush, self.last_arrival) {
            if now >= last + grace && batch.len() >= self.min_batch_size {
                return self.cut(CutReason::Flush, now);
            }
        }
        None
    }

    /// Next instant at which [`poll`](Self::poll) may cut the open batch
    pub fn next_wakeup(&self) -> Option<Instant> {
        let batch = self.open.as_ref()?;
        let timeout = batch.timeout_at();
        let idle = match (self.idle_flush, self.last_arrival) {
            (Some(grace), Some(last)) if batch.len() >= self.min_batch_size => Some(last + grace),
            _ => None,
        };
        Some(idle.map_or(timeout, |idle| idle.min(timeout)))
    }

    /// Cut whatever is open, regardless of thresholds
    pub fn flush(&mut self, now: Instant) -> Option<CutBatch<I, O>> {
        let batch = self.open.as_mut()?;
        self.pruned += batch.prune_cancelled(now);
        if batch.is_empty() {
            self.open = None;
            self.state = self.idle_state();
            return None;
        }
        self.cut(CutReason::Flush, now)
    }

    /// Enter the drain phase
    pub fn begin_shutdown(&mut self) {
        self.draining = true;
        if self.state == SchedulerState::Empty {
            self.state = SchedulerState::ShuttingDown;
        }
    }

    /// The cut batch has been handed to the dispatcher
    pub fn complete_handoff(&mut self) {
        if self.state == SchedulerState::Dispatching {
            self.state = if self.open.is_some() {
                SchedulerState::Accumulating
            } else {
                self.idle_state()
            };
        }
    }

    fn open_batch(&mut self, request: Request<I, O>, now: Instant, limits: Thresholds) {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        debug!(
            batch_id = id,
            max_batch_size = limits.max_batch_size,
            max_wait_us = limits.max_wait_time.as_micros() as u64,
            "Opening batch"
        );
        self.open = Some(Batch::open(id, request, now, limits));
        if self.state != SchedulerState::Dispatching {
            self.state = SchedulerState::Accumulating;
        }
    }

    fn cut(&mut self, reason: CutReason, now: Instant) -> Option<CutBatch<I, O>> {
        let batch = self.open.take()?;
        self.state = SchedulerState::Dispatching;
        let cut = batch.cut(reason, now);
        debug!(
            batch_id = cut.id(),
            size = cut.len(),
            reason = %reason,
            wait_us = cut.wait_time().as_micros() as u64,
            "Batch cut"
        );
        Some(cut)
    }

    fn idle_state(&self) -> SchedulerState {
        if self.draining {
            SchedulerState::ShuttingDown
        } else {
            SchedulerState::Empty
        }
    }
}

/// Async driver owning the queue consumer and the open batch
pub struct BatchScheduler<I, O> {
    accumulator: Accumulator<I, O>,
    queue: QueueReceiver<I, O>,
    policy: Arc<SharedPolicy>,
    in_flight: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<BatcherMetrics>,
}

impl<I, O> BatchScheduler<I, O> {
    pub fn new(
        accumulator: Accumulator<I, O>,
        queue: QueueReceiver<I, O>,
        policy: Arc<SharedPolicy>,
        in_flight: Arc<Semaphore>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<BatcherMetrics>,
    ) -> Self {
        Self { accumulator, queue, policy, in_flight, shutdown, metrics }
    }

    /// Run until the queue is closed and drained
    ///
    /// Every cut batch is passed to `handoff` together with an in-flight
    /// permit; the permit must be held until its dispatch completes.
    pub async fn run<F>(mut self, mut handoff: F)
    where
        F: FnMut(CutBatch<I, O>, OwnedSemaphorePermit),
    {
        let mut draining = *self.shutdown.borrow();
        if draining {
            self.begin_shutdown();
        }

        loop {
            let wakeup = self.accumulator.next_wakeup();

            // Arrivals are handled before the timer so that a request landing
            // together with the timeout still completes a size cut.
            let cut = tokio::select! {
                biased;

                changed = self.shutdown.changed(), if !draining => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        draining = true;
                        self.begin_shutdown();
                    }
                    None
                }

                request = self.queue.recv() => match request {
                    Some(request) => {
                        let now = Instant::now();
                        let limits = self.policy.thresholds();
                        self.accumulator
                            .offer(request, now, limits)
                            .or_else(|| self.accumulator.poll(now))
                    }
                    None => {
                        if let Some(cut) = self.accumulator.flush(Instant::now()) {
                            self.hand_off(cut, &mut handoff).await;
                        }
                        self.record_pruned();
                        break;
                    }
                },

                _ = sleep_until(wakeup), if wakeup.is_some() => {
                    self.accumulator.poll(Instant::now())
                }
            };

            self.record_pruned();
            if let Some(cut) = cut {
                self.hand_off(cut, &mut handoff).await;
            }
        }

        info!("Batch scheduler stopped");
    }

    fn begin_shutdown(&mut self) {
        info!(open_batch = self.accumulator.open_len(), "Scheduler draining");
        self.queue.close();
        self.accumulator.begin_shutdown();
    }

    async fn hand_off<F>(&mut self, cut: CutBatch<I, O>, handoff: &mut F)
    where
        F: FnMut(CutBatch<I, O>, OwnedSemaphorePermit),
    {
        self.metrics.record_cut(cut.reason());
        prometheus::set_in_flight(self.metrics.in_flight());

        // Waiting here stops draining the queue, which then rejects new work
        match self.in_flight.clone().acquire_owned().await {
            Ok(permit) => {
                self.accumulator.complete_handoff();
                handoff(cut, permit);
            }
            Err(_) => {
                self.accumulator.complete_handoff();
                let (_, completions) = cut.into_parts();
                let now = Instant::now();
                for completion in completions {
                    completion.resolve(Err(BatchError::ShuttingDown), now);
                }
                self.metrics.batches_in_flight.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn record_pruned(&mut self) {
        let pruned = self.accumulator.take_pruned();
        if pruned > 0 {
            self.metrics.record_cancelled(pruned);
            prometheus::record_cancelled(pruned);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
