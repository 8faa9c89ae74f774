use std::path::PathBuf;

use anyhow::Context;
use batchpilot_core::BatcherConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod simulate;

use simulate::LoadArgs;

#[derive(Parser)]
#[command(name = "batchpilot")]
#[command(version)]
#[command(about = "batchpilot - Adaptive micro-batching for expensive inference calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective batcher configuration as JSON
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run a synthetic load through the batcher and report throughput and latency
    Simulate {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        load: LoadArgs,

        /// Output file for the report (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        prometheus: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    Default,
    LowLatency,
    HighThroughput,
}

impl Preset {
    fn config(self) -> BatcherConfig {
        match self {
            Preset::Default => BatcherConfig::default(),
            Preset::LowLatency => BatcherConfig::low_latency(),
            Preset::HighThroughput => BatcherConfig::high_throughput(),
        }
    }
}

/// Configuration sources, lowest precedence first: file or preset,
/// `BATCHPILOT_*` environment, explicit flags
#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON configuration file (replaces the preset)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Built-in configuration preset
    #[arg(long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    #[arg(long)]
    max_batch_size: Option<usize>,

    #[arg(long)]
    max_wait_ms: Option<u64>,

    #[arg(long)]
    target_latency_ms: Option<u64>,

    #[arg(long)]
    max_in_flight: Option<usize>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Keep the thresholds fixed at their configured values
    #[arg(long)]
    no_adaptive: bool,
}

impl ConfigArgs {
    fn resolve(&self) -> anyhow::Result<BatcherConfig> {
        let base = match &self.file {
            Some(path) => BatcherConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => self.preset.config(),
        };
        let mut config = base.with_env_overrides();

        if let Some(n) = self.max_batch_size {
            config.max_batch_size = n;
        }
        if let Some(ms) = self.max_wait_ms {
            config.max_wait_time = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.target_latency_ms {
            config.target_latency = std::time::Duration::from_millis(ms);
        }
        if let Some(n) = self.max_in_flight {
            config.max_in_flight_batches = n;
        }
        if let Some(n) = self.queue_capacity {
            config.queue_capacity = n;
        }
        if self.no_adaptive {
            config.adaptive = false;
        }

        config.validate().context("Invalid batcher configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so that JSON on stdout stays machine-readable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchpilot=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { config } => {
            let config = config.resolve()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Simulate { config, load, output, prometheus } => {
            let config = config.resolve()?;
            if prometheus {
                batchpilot_core::metrics::register_metrics()
                    .context("Failed to register Prometheus metrics")?;
            }

            println!("batchpilot simulation\n");
            println!(
                "Requests: {} (concurrency {}), backend cost: {:.1}ms + {:.2}ms/item\n",
                load.requests, load.concurrency, load.overhead_ms, load.per_item_ms
            );

            let report = simulate::run(config, &load).await?;
            simulate::print_report(&report);

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                println!("\nReport saved to: {}", path.display());
            }

            if prometheus {
                println!("\n=== Prometheus ===");
                print!("{}", batchpilot_core::metrics::encode_metrics());
            }
        }
    }

    Ok(())
}
