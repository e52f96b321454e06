//! Benchmark run: setup, concurrent producers, completion drain and
//! reconciliation of sent against received correlation ids.

use crate::client::{Job, QueueService};
use crate::config::{Config, JobConfig};
use crate::reconcile::Reconciliation;
use crate::sink::{Completions, CorrelationId, Payload};
use crate::stats::{Stat, StatSnapshot};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchReport {
    pub timestamp: String,
    pub service: String,
    pub queue_name: String,
    pub concurrency: u32,
    pub total_jobs: u64,
    pub planned_jobs: u64,
    pub dropped_jobs: u64,
    pub failure_rate: u8,
    pub sent: u64,
    pub submit_failures: u64,
    pub received: u64,
    pub enqueue_duration_ms: u64,
    /// Time from the start of submission until the last completion was drained
    pub worker_duration_ms: u64,
    /// `planned_jobs / enqueue_duration`
    pub enqueue_qps: f64,
    /// `received / worker_duration`; only successful callbacks count
    pub worker_qps: f64,
    /// `stat.total / worker_duration`; counts every decoded callback, including injected failures
    pub actual_worker_qps: f64,
    pub drain_timed_out: bool,
    pub stat: StatSnapshot,
    pub reconciliation: Reconciliation,
}

/// Everything a producer needs to build its jobs.
#[derive(Debug, Clone)]
struct JobTemplate {
    callback_url: String,
    job: JobConfig,
}

impl JobTemplate {
    fn build(&self, id: CorrelationId) -> Job {
        let mut job = Job::new(self.callback_url.clone(), Payload { id });
        job.category = self.job.category.clone();
        job.run_after = self.job.run_after;
        job.max_retries = self.job.max_retries;
        job.retry_delay = self.job.retry_delay;
        job.timeout = self.job.timeout;
        job
    }
}

#[derive(Debug, Default)]
struct ProducerOutcome {
    sent: Vec<CorrelationId>,
    failures: u64,
}

/// How many completions the drain loop waits for, and until when.
///
/// The deadline stays unset while producers are still submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTarget {
    pub goal: u64,
    pub deadline: Option<Instant>,
}

impl DrainTarget {
    pub fn open(goal: u64) -> Self {
        Self {
            goal,
            deadline: None,
        }
    }
}

#[derive(Debug)]
pub struct DrainOutcome {
    pub received: Vec<CorrelationId>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

pub struct Benchmark {
    config: Config,
    service: Arc<dyn QueueService>,
    callback_url: String,
    stat: Arc<Stat>,
}

impl Benchmark {
    pub fn new(
        config: Config,
        service: Arc<dyn QueueService>,
        callback_url: impl Into<String>,
        stat: Arc<Stat>,
    ) -> Self {
        Self {
            config,
            service,
            callback_url: callback_url.into(),
            stat,
        }
    }

    pub async fn run(&self, completions: Completions) -> Result<BenchReport> {
        let bench = &self.config.bench;

        let queue = self
            .service
            .ensure_queue(&bench.queue_name, bench.max_workers)
            .await
            .with_context(|| format!("Failed to ensure queue '{}'", bench.queue_name))?;
        info!("Queue '{}': {:?}", bench.queue_name, queue);

        let routing = self
            .service
            .ensure_routing(&bench.queue_name, self.config.job.category.as_deref())
            .await
            .with_context(|| format!("Failed to ensure routing '{}'", bench.queue_name))?;
        info!("Routing '{}': {:?}", bench.queue_name, routing);

        let per_producer = self.config.per_producer();
        let planned = self.config.planned_jobs();
        let dropped = self.config.dropped_jobs();
        if dropped > 0 {
            warn!(
                "total_jobs {} is not divisible by concurrency {}; {} job(s) will not be sent",
                bench.total_jobs, bench.concurrency, dropped
            );
        }
        info!(
            "Concurrency: {}, total jobs: {} ({} per producer)",
            bench.concurrency, planned, per_producer
        );

        let (target_tx, target_rx) = watch::channel(DrainTarget::open(planned));
        let start = Instant::now();
        let print_every = Duration::from_millis(bench.print_every_ms.max(100));

        let drain_handle = tokio::spawn(drain(completions, target_rx, start, print_every));

        let template = Arc::new(JobTemplate {
            callback_url: self.callback_url.clone(),
            job: self.config.job.clone(),
        });
        let mut producers = JoinSet::new();
        for index in 0..bench.concurrency {
            let seed = bench.seed.map(|s| s.wrapping_add(index as u64));
            producers.spawn(produce(
                index,
                per_producer,
                bench.queue_name.clone(),
                self.service.clone(),
                template.clone(),
                seed,
            ));
        }

        let mut sent = Vec::with_capacity(planned as usize);
        let mut submit_failures = 0u64;
        while let Some(joined) = producers.join_next().await {
            let outcome = joined.context("Producer task panicked")?;
            sent.extend(outcome.sent);
            submit_failures += outcome.failures;
        }
        let enqueue_elapsed = start.elapsed();
        info!(
            "Enqueued {} job(s) in {:.3}s ({} submission failure(s))",
            sent.len(),
            enqueue_elapsed.as_secs_f64(),
            submit_failures
        );

        // Failed submissions never call back; stop waiting for them. The
        // deadline only starts once nothing more will be submitted.
        let _ = target_tx.send(DrainTarget {
            goal: sent.len() as u64,
            deadline: Some(Instant::now() + Duration::from_millis(bench.drain_timeout_ms)),
        });

        let drained = drain_handle.await.context("Drain task panicked")?;
        let stat = self.stat.snapshot();
        let received = drained.received.len() as u64;
        info!(
            "Received {} completion(s) in {:.3}s",
            received,
            drained.elapsed.as_secs_f64()
        );

        let sent_count = sent.len() as u64;
        let reconciliation = Reconciliation::compute(sent, drained.received);
        if reconciliation.matched {
            info!("Reconciliation {}", reconciliation);
        } else {
            warn!("Reconciliation {}", reconciliation);
        }

        Ok(BenchReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: self.service.name().to_string(),
            queue_name: bench.queue_name.clone(),
            concurrency: bench.concurrency,
            total_jobs: bench.total_jobs,
            planned_jobs: planned,
            dropped_jobs: dropped,
            failure_rate: bench.failure_rate,
            sent: sent_count,
            submit_failures,
            received,
            enqueue_duration_ms: enqueue_elapsed.as_millis() as u64,
            worker_duration_ms: drained.elapsed.as_millis() as u64,
            enqueue_qps: qps(planned, enqueue_elapsed),
            worker_qps: qps(received, drained.elapsed),
            actual_worker_qps: qps(stat.total, drained.elapsed),
            drain_timed_out: drained.timed_out,
            stat,
            reconciliation,
        })
    }
}

async fn produce(
    index: u32,
    jobs: u64,
    queue_name: String,
    service: Arc<dyn QueueService>,
    template: Arc<JobTemplate>,
    seed: Option<u64>,
) -> ProducerOutcome {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut outcome = ProducerOutcome {
        sent: Vec::with_capacity(jobs as usize),
        failures: 0,
    };

    for _ in 0..jobs {
        let id: CorrelationId = rng.random_range(0..=i64::MAX as u64);
        let job = template.build(id);

        match service.submit(&queue_name, &job).await {
            Ok(enqueued) => {
                debug!("Producer {} enqueued job {:?} ({})", index, enqueued.id, id);
                outcome.sent.push(id);
            }
            Err(e) => {
                warn!("Producer {} submission error: {}", index, e);
                outcome.failures += 1;
            }
        }
    }

    outcome
}

/// Collect completions until the target goal is reached, the channel
/// closes or the target's deadline passes. The target may change while
/// draining.
pub async fn drain(
    mut completions: Completions,
    mut target: watch::Receiver<DrainTarget>,
    start: Instant,
    print_every: Duration,
) -> DrainOutcome {
    let mut received = Vec::with_capacity(target.borrow().goal as usize);
    let mut target_open = true;

    let mut ticker = tokio::time::interval(print_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let timed_out = loop {
        let DrainTarget { goal, deadline } = *target.borrow_and_update();
        if received.len() as u64 >= goal {
            break false;
        }

        let expired = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            id = completions.recv() => match id {
                Some(id) => received.push(id),
                None => {
                    warn!("Completion channel closed after {} of {} job(s)", received.len(), goal);
                    break false;
                }
            },
            changed = target.changed(), if target_open => {
                if changed.is_err() {
                    target_open = false;
                }
            }
            _ = expired => {
                warn!(
                    "Drain deadline reached with {} of {} completion(s)",
                    received.len(),
                    goal
                );
                break true;
            }
            _ = ticker.tick() => {
                info!("Progress: {}/{} completion(s)", received.len(), goal);
            }
        }
    };

    DrainOutcome {
        received,
        elapsed: start.elapsed(),
        timed_out,
    }
}

fn qps(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
