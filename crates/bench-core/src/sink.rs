//! HTTP endpoint the queue service calls when it dispatches a job.
//!
//! Every request is one simulated job execution. The body must decode to a
//! [`Payload`]; decoded jobs are counted, a configurable share of them is
//! failed at random, and the rest publish their correlation id on the
//! completion channel before the response is written.

use crate::config::SinkConfig;
use crate::stats::Stat;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer-chosen identifier carried in every job payload.
pub type CorrelationId = u64;

/// Receiving half of the completion channel.
pub type Completions = mpsc::Receiver<CorrelationId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Success,
    Failure,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
}

/// What happened to a single callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    DecodeError(String),
    RandomFailure(CorrelationId),
    Published(CorrelationId),
}

impl CallbackOutcome {
    pub fn into_result(self) -> JobResult {
        match self {
            CallbackOutcome::DecodeError(message) => JobResult {
                status: JobStatus::Failure,
                message,
            },
            CallbackOutcome::RandomFailure(_) => JobResult {
                status: JobStatus::Failure,
                message: "random failure".to_string(),
            },
            CallbackOutcome::Published(_) => JobResult {
                status: JobStatus::Success,
                message: String::new(),
            },
        }
    }
}

#[derive(Clone)]
struct SinkState {
    stat: Arc<Stat>,
    failure_rate: u8,
    completions: mpsc::Sender<CorrelationId>,
}

impl SinkState {
    async fn process(&self, body: &[u8]) -> CallbackOutcome {
        let payload: Payload = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to decode callback payload: {}", e);
                self.stat.error_occurred();
                return CallbackOutcome::DecodeError(e.to_string());
            }
        };

        self.stat.arrive_job();

        let roll: u8 = rand::rng().random_range(0..100);
        if roll < self.failure_rate {
            self.stat.fail();
            return CallbackOutcome::RandomFailure(payload.id);
        }

        // Blocks until the drain loop has room; this is the run's backpressure point.
        if self.completions.send(payload.id).await.is_err() {
            debug!("Completion {} arrived after the drain loop stopped", payload.id);
        }
        CallbackOutcome::Published(payload.id)
    }
}

async fn handle_callback(
    State(state): State<SinkState>,
    body: Bytes,
) -> (StatusCode, Json<JobResult>) {
    let outcome = state.process(&body).await;
    (StatusCode::OK, Json(outcome.into_result()))
}

pub struct CallbackSink {
    addr: SocketAddr,
    callback_url: String,
    stat: Arc<Stat>,
    router: Router,
    listener: Option<TcpListener>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl CallbackSink {
    /// Bind the listener and create the completion channel.
    pub async fn bind(config: &SinkConfig, failure_rate: u8) -> Result<(Self, Completions)> {
        let listener = TcpListener::bind(config.bind.as_str())
            .await
            .with_context(|| format!("Failed to bind callback sink on {}", config.bind))?;
        let addr = listener.local_addr()?;
        let callback_url = format!("http://{}:{}/", config.advertise_host, addr.port());

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stat = Arc::new(Stat::new());
        let state = SinkState {
            stat: stat.clone(),
            failure_rate,
            completions: tx,
        };
        let router = Router::new().fallback(handle_callback).with_state(state);

        let sink = Self {
            addr,
            callback_url,
            stat,
            router,
            listener: Some(listener),
            cancel: CancellationToken::new(),
            handle: None,
        };
        Ok((sink, rx))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL embedded in every submitted job.
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn stat(&self) -> Arc<Stat> {
        self.stat.clone()
    }

    /// Start serving callbacks on a background task.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("Callback sink already started")?;
        let router = self.router.clone();
        let cancel = self.cancel.clone();

        info!("Callback sink listening on {}", self.addr);
        self.handle = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }));
        Ok(())
    }

    /// Stop accepting connections and wait up to `grace` for in-flight requests.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        self.cancel.cancel();

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => {
                joined.context("Callback sink task panicked")??;
                info!("Callback sink stopped");
            }
            Err(_) => {
                warn!("Callback sink did not drain within {:?}, aborting", grace);
                handle.abort();
            }
        }
        Ok(())
    }
}

impl Drop for CallbackSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
