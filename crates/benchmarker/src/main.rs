use anyhow::{Context, Result};
use bench_core::{
    BenchReport, Benchmark, CallbackSink, Config, HttpQueueClient, MockQueueService, QueueService,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "benchmarker")]
#[command(about = "Job queue benchmark - floods a queue and verifies every job calls back")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Queue service base URL (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Number of concurrent producers (overrides config)
    #[arg(long, alias = "concurrent")]
    concurrency: Option<u32>,

    /// Total number of jobs to submit (overrides config)
    #[arg(long)]
    total_jobs: Option<u64>,

    /// Percentage of callbacks to fail at random, 0-99 (overrides config)
    #[arg(long)]
    failure_rate: Option<u8>,

    /// Give up waiting for callbacks N milliseconds after submission ends (overrides config)
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Deterministic seed for correlation ids (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Log progress every N milliseconds (overrides config)
    #[arg(long)]
    print_every_ms: Option<u64>,

    /// Queue service: mock (in-process) or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Directory for the JSON result file
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.target.endpoint = endpoint.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.bench.concurrency = concurrency;
        }
        if let Some(total_jobs) = self.total_jobs {
            config.bench.total_jobs = total_jobs;
        }
        if let Some(failure_rate) = self.failure_rate {
            config.bench.failure_rate = failure_rate;
        }
        if let Some(drain_timeout_ms) = self.drain_timeout_ms {
            config.bench.drain_timeout_ms = drain_timeout_ms;
        }
        if let Some(seed) = self.seed {
            config.bench.seed = Some(seed);
        }
        if let Some(print_every_ms) = self.print_every_ms {
            config.bench.print_every_ms = print_every_ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let (mut sink, completions) = CallbackSink::bind(&config.sink, config.bench.failure_rate)
        .await
        .context("Failed to start callback sink")?;
    sink.start()?;

    let service: Arc<dyn QueueService> = match args.mode.as_str() {
        "mock" => Arc::new(MockQueueService::new(0)),
        "http" => Arc::new(
            HttpQueueClient::new(
                &config.target.endpoint,
                config.bench.concurrency as usize,
                config.target.timeout_ms,
            )
            .context("Failed to create HTTP client")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    info!("Using queue service: {}", service.name());
    info!("Endpoint: {}", config.target.endpoint);
    info!("Callback url: {}", sink.callback_url());
    info!("Failure rate: {}%", config.bench.failure_rate);

    let benchmark = Benchmark::new(config, service, sink.callback_url(), sink.stat());
    let result = benchmark.run(completions).await;
    sink.shutdown(Duration::from_secs(5)).await?;
    let report = result?;

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    std::fs::create_dir_all(&args.output_dir).ok();
    let output_path = args.output_dir.join(format!("bench_{}.json", timestamp));
    let report_json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&output_path, report_json)
        .with_context(|| format!("Failed to write {:?}", output_path))?;

    info!("Results written to {:?}", output_path);
    print_summary(&report);

    Ok(())
}

fn print_summary(report: &BenchReport) {
    println!("\n=== Benchmark Summary ({}) ===", report.service);
    println!("Queue: {}", report.queue_name);
    println!("Concurrent: {}", report.concurrency);
    println!("Total Jobs: {}", report.total_jobs);
    if report.dropped_jobs > 0 {
        println!("Dropped (remainder): {}", report.dropped_jobs);
    }
    println!();
    println!("Sent: {}", report.sent);
    println!("Submission failures: {}", report.submit_failures);
    println!(
        "Enqueue Time: {:.3} seconds",
        report.enqueue_duration_ms as f64 / 1000.0
    );
    println!(
        "Enqueue Throughput: {:.3} qps (planned / enqueue time)",
        report.enqueue_qps
    );
    println!();
    println!("Received: {}", report.received);
    println!(
        "Callbacks: total={} failure={} error={}",
        report.stat.total, report.stat.failure, report.stat.error
    );
    println!(
        "Worker Time: {:.2} seconds{}",
        report.worker_duration_ms as f64 / 1000.0,
        if report.drain_timed_out {
            " (deadline reached)"
        } else {
            ""
        }
    );
    println!(
        "Worker Throughput: {:.3} qps (received / worker time)",
        report.worker_qps
    );
    println!(
        "Actual Worker Throughput: {:.3} qps (all callbacks / worker time)",
        report.actual_worker_qps
    );
    println!();
    println!("Reconciliation: {}", report.reconciliation);
    if !report.reconciliation.matched {
        println!("Lost: {:.2}%", report.reconciliation.lost_rate());
    }
    println!();
}
