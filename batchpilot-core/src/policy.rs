//! Adaptive batching policy.
//!
//! A damped proportional controller that steers end-to-end latency
//! (accumulation wait + dispatch latency) towards `target_latency`:
//!
//! ```text
//! err   = clamp((target - ewma_latency) / target, -1, 1)
//! wait' = clamp(wait + gain * err * (hard_max_wait - min_wait), min_wait, hard_max_wait)
//! size' = clamp(size + gain * err * (hard_max_size - min_size), min_size, hard_max_size)
//! ```
//!
//! Errors inside the `latency_tolerance` dead-band leave the thresholds
//! untouched. While growing, the size limit only moves when batches are
//! actually filling it; the wait window grows regardless.
//!
//! [`AdaptivePolicy`] is the pure controller. [`SharedPolicy`] wraps it for
//! the orchestrator: one writer (the task completing a dispatch) and many
//! readers that see an atomic, possibly slightly stale, snapshot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::BatcherConfig;

/// Fraction of the current size limit the smoothed batch size must reach
/// before the limit is allowed to grow
const SIZE_GROWTH_FILL_RATIO: f64 = 0.9;

/// Batching thresholds in force for newly opened batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub max_batch_size: usize,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub max_wait_time: Duration,
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyState {
    /// EWMA of end-to-end batch latency, if anything was observed
    pub smoothed_latency_ms: Option<f64>,
    /// EWMA of realized batch size, if anything was observed
    pub smoothed_batch_size: Option<f64>,
    pub max_batch_size: usize,
    pub max_wait_ms: f64,
    pub observations: u64,
}

/// Latency-driven threshold controller
#[derive(Debug, Clone)]
pub struct AdaptivePolicy {
    enabled: bool,
    target_secs: f64,
    smoothing: f64,
    gain: f64,
    tolerance: f64,

    min_size: f64,
    hard_max_size: f64,
    min_wait_secs: f64,
    hard_max_wait_secs: f64,

    size_limit: f64,
    wait_secs: f64,
    smoothed_latency_secs: Option<f64>,
    smoothed_batch_size: Option<f64>,
    observations: u64,
}

impl AdaptivePolicy {
    /// Create a controller starting at the configured hard maxima
    ///
    /// The config is expected to have passed [`BatcherConfig::validate`].
    pub fn new(config: &BatcherConfig) -> Self {
        Self {
            enabled: config.adaptive,
            target_secs: config.target_latency.as_secs_f64(),
            smoothing: config.smoothing,
            gain: config.adjust_gain,
            tolerance: config.latency_tolerance,
            min_size: config.min_batch_size as f64,
            hard_max_size: config.max_batch_size as f64,
            min_wait_secs: config.min_wait_time.as_secs_f64(),
            hard_max_wait_secs: config.max_wait_time.as_secs_f64(),
            size_limit: config.max_batch_size as f64,
            wait_secs: config.max_wait_time.as_secs_f64(),
            smoothed_latency_secs: None,
            smoothed_batch_size: None,
            observations: 0,
        }
    }

    /// Feed one completed batch into the controller
    pub fn observe(&mut self, batch_size: usize, wait_time: Duration, dispatch_latency: Duration) {
        if batch_size == 0 {
            return;
        }
        self.observations += 1;

        let latency = (wait_time + dispatch_latency).as_secs_f64();
        let latency = ewma(self.smoothed_latency_secs, latency, self.smoothing);
        let size = ewma(self.smoothed_batch_size, batch_size as f64, self.smoothing);
        self.smoothed_latency_secs = Some(latency);
        self.smoothed_batch_size = Some(size);

        if !self.enabled {
            return;
        }

        let err = ((self.target_secs - latency) / self.target_secs).clamp(-1.0, 1.0);
        if err.abs() <= self.tolerance {
            return;
        }

        let wait_step = self.gain * err * (self.hard_max_wait_secs - self.min_wait_secs);
        self.wait_secs =
            (self.wait_secs + wait_step).clamp(self.min_wait_secs, self.hard_max_wait_secs);

        let filling = size >= self.size_limit * SIZE_GROWTH_FILL_RATIO;
        if err < 0.0 || filling {
            let size_step = self.gain * err * (self.hard_max_size - self.min_size);
            self.size_limit =
                (self.size_limit + size_step).clamp(self.min_size, self.hard_max_size);
        }
    }

    /// Thresholds for the next batch
    pub fn current_thresholds(&self) -> Thresholds {
        let max_batch_size = (self.size_limit.round() as usize)
            .clamp(self.min_size as usize, self.hard_max_size as usize);
        let max_wait_time = micros(self.wait_secs)
            .clamp(micros(self.min_wait_secs), micros(self.hard_max_wait_secs));
        Thresholds { max_batch_size, max_wait_time }
    }

    pub fn state(&self) -> PolicyState {
        let thresholds = self.current_thresholds();
        PolicyState {
            smoothed_latency_ms: self.smoothed_latency_secs.map(|s| s * 1000.0),
            smoothed_batch_size: self.smoothed_batch_size,
            max_batch_size: thresholds.max_batch_size,
            max_wait_ms: thresholds.max_wait_time.as_secs_f64() * 1000.0,
            observations: self.observations,
        }
    }
}

/// Whole microseconds, so configured millisecond values survive the f64 round trip
fn micros(secs: f64) -> Duration {
    Duration::from_micros((secs * 1e6).round() as u64)
}

fn ewma(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Policy shared between the scheduler (reader) and dispatch tasks (writer)
#[derive(Debug)]
pub struct SharedPolicy {
    controller: Mutex<AdaptivePolicy>,
    max_batch_size: AtomicUsize,
    max_wait_nanos: AtomicU64,
}

impl SharedPolicy {
    pub fn new(policy: AdaptivePolicy) -> Self {
        let thresholds = policy.current_thresholds();
        Self {
            controller: Mutex::new(policy),
            max_batch_size: AtomicUsize::new(thresholds.max_batch_size),
            max_wait_nanos: AtomicU64::new(thresholds.max_wait_time.as_nanos() as u64),
        }
    }

    /// Latest published thresholds; never blocks
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_batch_size: self.max_batch_size.load(Ordering::Acquire),
            max_wait_time: Duration::from_nanos(self.max_wait_nanos.load(Ordering::Acquire)),
        }
    }

    /// Record a completed batch and publish the recalibrated thresholds
    pub fn observe(
        &self,
        batch_size: usize,
        wait_time: Duration,
        dispatch_latency: Duration,
    ) -> Thresholds {
        let mut controller = self.controller.lock().unwrap_or_else(|e| e.into_inner());
        let before = controller.current_thresholds();
        controller.observe(batch_size, wait_time, dispatch_latency);
        let after = controller.current_thresholds();

        self.max_batch_size.store(after.max_batch_size, Ordering::Release);
        self.max_wait_nanos
            .store(after.max_wait_time.as_nanos() as u64, Ordering::Release);

        if before != after {
            debug!(
                max_batch_size = after.max_batch_size,
                max_wait_us = after.max_wait_time.as_micros() as u64,
                "Batching thresholds adjusted"
            );
        }
        after
    }

    pub fn state(&self) -> PolicyState {
        self.controller.lock().unwrap_or_else(|e| e.into_inner()).state()
    }
}
