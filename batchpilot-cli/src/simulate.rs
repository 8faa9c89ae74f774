//! Synthetic load generator for the `simulate` command.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use batchpilot_core::{
    BatchError, BatcherConfig, InferenceBackend, MetricsSnapshot, Orchestrator, PolicyState,
    Thresholds,
};
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

#[derive(Args, Debug, Clone, Serialize)]
pub struct LoadArgs {
    /// Total number of requests to submit
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub requests: usize,

    /// Number of concurrent callers
    #[arg(short, long, default_value_t = 64)]
    pub concurrency: usize,

    /// Fixed cost of every backend call
    #[arg(long, default_value_t = 20.0)]
    pub overhead_ms: f64,

    /// Additional cost per batched item
    #[arg(long, default_value_t = 0.5)]
    pub per_item_ms: f64,

    /// Fraction of backend calls that fail, in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,
}

/// Backend whose cost grows linearly with the batch size
pub struct SyntheticBackend {
    overhead: Duration,
    per_item: Duration,
    failure_rate: f64,
    calls: AtomicU64,
}

impl SyntheticBackend {
    pub fn new(load: &LoadArgs) -> Self {
        Self {
            overhead: Duration::from_secs_f64(load.overhead_ms.max(0.0) / 1000.0),
            per_item: Duration::from_secs_f64(load.per_item_ms.max(0.0) / 1000.0),
            failure_rate: load.failure_rate.clamp(0.0, 1.0),
            calls: AtomicU64::new(0),
        }
    }

    /// Failures are spread evenly over the calls rather than drawn at random
    fn should_fail(&self, call: u64) -> bool {
        let before = (call as f64 * self.failure_rate).floor();
        let after = ((call + 1) as f64 * self.failure_rate).floor();
        after > before
    }
}

impl InferenceBackend<u64, u64> for SyntheticBackend {
    async fn infer(&self, inputs: Vec<u64>) -> anyhow::Result<Vec<u64>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let cost = self.overhead + self.per_item * inputs.len() as u32;
        tokio::time::sleep(cost).await;

        if self.should_fail(call) {
            anyhow::bail!("synthetic failure on call {}", call);
        }
        Ok(inputs.into_iter().map(|x| x.wrapping_mul(2)).collect())
    }
}

#[derive(Debug, Default)]
struct CallerStats {
    latencies_us: Vec<u64>,
    completed: u64,
    failed: u64,
    rejected: u64,
    cancelled: u64,
}

impl CallerStats {
    fn merge(&mut self, other: CallerStats) {
        self.latencies_us.extend(other.latencies_us);
        self.completed += other.completed;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.cancelled += other.cancelled;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    fn from_micros(mut samples: Vec<u64>) -> Self {
        samples.sort_unstable();
        let mean = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };
        Self {
            mean_ms: mean / 1000.0,
            p50_ms: percentile(&samples, 50.0) as f64 / 1000.0,
            p90_ms: percentile(&samples, 90.0) as f64 / 1000.0,
            p99_ms: percentile(&samples, 99.0) as f64 / 1000.0,
            max_ms: samples.last().copied().unwrap_or(0) as f64 / 1000.0,
        }
    }
}

/// Nearest-rank percentile of sorted samples
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub run_id: String,
    pub timestamp: String,
    pub config: BatcherConfig,
    pub load: LoadArgs,
    pub duration_ms: f64,
    pub throughput_rps: f64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub latency: LatencySummary,
    pub batches: u64,
    pub avg_batch_size: f64,
    pub largest_batch: usize,
    pub final_thresholds: Thresholds,
    pub policy: PolicyState,
    pub metrics: MetricsSnapshot,
}

/// Drive `load.requests` calls through a fresh orchestrator
pub async fn run(config: BatcherConfig, load: &LoadArgs) -> anyhow::Result<SimulationReport> {
    let run_id = Uuid::new_v4().to_string();
    let orchestrator: Orchestrator<u64, u64> =
        Orchestrator::start(config.clone(), SyntheticBackend::new(load))
            .context("Failed to start batcher")?;

    let mut reports = orchestrator.subscribe();
    let largest_batch = tokio::spawn(async move {
        let mut largest = 0;
        loop {
            match reports.recv().await {
                Ok(report) => largest = largest.max(report.size),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break largest,
            }
        }
    });

    info!(
        run_id = %run_id,
        requests = load.requests,
        concurrency = load.concurrency,
        "Simulation started"
    );

    let started = Instant::now();
    let next = Arc::new(AtomicUsize::new(0));
    let callers: Vec<_> = (0..load.concurrency.max(1))
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let next = next.clone();
            let total = load.requests;
            tokio::spawn(async move {
                let mut stats = CallerStats::default();
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= total {
                        break stats;
                    }
                    let sent = Instant::now();
                    match orchestrator.call(i as u64).await {
                        Ok(_) => {
                            stats.completed += 1;
                            stats.latencies_us.push(sent.elapsed().as_micros() as u64);
                        }
                        Err(BatchError::QueueFull { .. }) => {
                            stats.rejected += 1;
                            // Back off briefly before the next request
                            tokio::task::yield_now().await;
                        }
                        Err(BatchError::RequestCancelled { .. }) => stats.cancelled += 1,
                        Err(_) => stats.failed += 1,
                    }
                }
            })
        })
        .collect();

    let mut stats = CallerStats::default();
    for result in futures::future::join_all(callers).await {
        stats.merge(result.context("Caller task panicked")?);
    }
    let elapsed = started.elapsed();

    orchestrator.shutdown().await;
    let final_thresholds = orchestrator.thresholds();
    let policy = orchestrator.policy_state();
    let metrics = orchestrator.metrics();
    drop(orchestrator);

    let largest_batch = largest_batch.await.context("Report collector panicked")?;
    let secs = elapsed.as_secs_f64();

    info!(
        run_id = %run_id,
        completed = stats.completed,
        elapsed_ms = elapsed.as_millis() as u64,
        "Simulation finished"
    );

    Ok(SimulationReport {
        run_id,
        timestamp: Utc::now().to_rfc3339(),
        config,
        load: load.clone(),
        duration_ms: secs * 1000.0,
        throughput_rps: if secs > 0.0 { stats.completed as f64 / secs } else { 0.0 },
        completed: stats.completed,
        failed: stats.failed,
        rejected: stats.rejected,
        cancelled: stats.cancelled,
        latency: LatencySummary::from_micros(stats.latencies_us),
        batches: metrics.batches_completed,
        avg_batch_size: metrics.avg_batch_size,
        largest_batch,
        final_thresholds,
        policy,
        metrics,
    })
}

pub fn print_report(report: &SimulationReport) {
    println!("=== Throughput ===");
    println!("Duration: {:.1} ms", report.duration_ms);
    println!("Completed: {}", report.completed);
    println!("Failed: {}", report.failed);
    println!("Rejected: {}", report.rejected);
    println!("Cancelled: {}", report.cancelled);
    println!("Throughput: {:.1} req/s", report.throughput_rps);
    println!();

    println!("=== Latency ===");
    println!("Mean: {:.2} ms", report.latency.mean_ms);
    println!("p50: {:.2} ms", report.latency.p50_ms);
    println!("p90: {:.2} ms", report.latency.p90_ms);
    println!("p99: {:.2} ms", report.latency.p99_ms);
    println!("Max: {:.2} ms", report.latency.max_ms);
    println!();

    println!("=== Batching ===");
    println!("Batches: {}", report.batches);
    println!("Average size: {:.2}", report.avg_batch_size);
    println!("Largest batch: {}", report.largest_batch);
    println!(
        "Cuts: {} full, {} timeout, {} flush",
        report.metrics.batches_full, report.metrics.batches_timeout, report.metrics.batches_flush
    );
    println!(
        "Final thresholds: max_batch_size={}, max_wait={:.2} ms",
        report.final_thresholds.max_batch_size,
        report.final_thresholds.max_wait_time.as_secs_f64() * 1000.0
    );
}
