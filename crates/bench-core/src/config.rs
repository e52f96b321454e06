use serde::{Deserialize, Serialize};
use std::path::Path;

/// Highest accepted value for `bench.failure_rate` (percent, inclusive).
pub const MAX_FAILURE_RATE: u8 = 99;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings the benchmark cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bench.failure_rate > MAX_FAILURE_RATE {
            anyhow::bail!(
                "failure_rate must be between 0 and {} (got {})",
                MAX_FAILURE_RATE,
                self.bench.failure_rate
            );
        }
        if self.bench.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.bench.total_jobs == 0 {
            anyhow::bail!("total_jobs must be at least 1");
        }
        if self.sink.channel_capacity == 0 {
            anyhow::bail!("sink.channel_capacity must be at least 1");
        }

        let url = url::Url::parse(&self.target.endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid endpoint {}: {}", self.target.endpoint, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!(
                "endpoint must be http:// or https:// (got {})",
                self.target.endpoint
            );
        }
        Ok(())
    }

    /// Jobs each producer submits. The remainder of a non-divisible total is dropped.
    pub fn per_producer(&self) -> u64 {
        if self.bench.concurrency == 0 {
            return 0;
        }
        self.bench.total_jobs / self.bench.concurrency as u64
    }

    /// Jobs the producers will actually attempt.
    pub fn planned_jobs(&self) -> u64 {
        self.per_producer() * self.bench.concurrency as u64
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.bench.total_jobs - self.planned_jobs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL of the queue service
    pub endpoint: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Queue (and routing category) every job is submitted to
    pub queue_name: String,
    pub total_jobs: u64,
    /// Number of concurrent producers
    pub concurrency: u32,
    /// Percentage of callbacks answered with a random failure (0-99)
    pub failure_rate: u8,
    /// Worker concurrency requested for the queue on creation
    pub max_workers: u32,
    /// Deadline for draining completions, armed once every producer has finished submitting
    pub drain_timeout_ms: u64,
    /// Deterministic seed for correlation identifiers
    pub seed: Option<u64>,
    /// Progress log interval in milliseconds
    pub print_every_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            queue_name: "benchmarker01".to_string(),
            total_jobs: 1000,
            concurrency: 10,
            failure_rate: 0,
            max_workers: 50,
            drain_timeout_ms: 60_000,
            seed: None,
            print_every_ms: 1000,
        }
    }
}

/// Scheduling attributes copied into every submitted job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub category: Option<String>,
    pub run_after: u64,
    pub max_retries: u32,
    pub retry_delay: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Listener address; port 0 picks an ephemeral port
    pub bind: String,
    /// Host the queue service uses to reach the sink
    pub advertise_host: String,
    /// Completion channel buffer. 1 keeps the sink in lockstep with the drain loop.
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            channel_capacity: 1,
        }
    }
}
