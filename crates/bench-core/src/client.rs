use crate::error::{ClientError, ClientResult};
use crate::sink::{JobResult, JobStatus, Payload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Polling interval (ms) requested for queues created by the benchmark.
pub const QUEUE_POLLING_INTERVAL: u64 = 100;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub url: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub run_after: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay: u64,
    #[serde(default)]
    pub timeout: u64,
}

impl Job {
    pub fn new(url: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            queue_name: None,
            category: None,
            url: url.into(),
            payload: serde_json::json!({ "id": payload.id }),
            run_after: 0,
            max_retries: 0,
            retry_delay: 0,
            timeout: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub polling_interval: u64,
    pub max_workers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_category: Option<String>,
}

/// Outcome of an ensure-exists call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Existing,
    Created,
}

/// Queue service operations the benchmark depends on.
pub trait QueueService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the queue unless it already exists.
    fn ensure_queue<'a>(
        &'a self,
        name: &'a str,
        max_workers: u32,
    ) -> BoxFuture<'a, ClientResult<Ensured>>;

    /// Create the routing for `name` unless it already exists.
    fn ensure_routing<'a>(
        &'a self,
        name: &'a str,
        category: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<Ensured>>;

    /// Submit one job; the returned job carries the service-assigned id.
    fn submit<'a>(&'a self, name: &'a str, job: &'a Job) -> BoxFuture<'a, ClientResult<Job>>;
}

/// REST client for the queue service.
///
/// Built once per run. The idle pool per host is sized to the producer
/// concurrency so producers do not queue behind each other for connections.
pub struct HttpQueueClient {
    client: reqwest::Client,
    base: url::Url,
}

impl HttpQueueClient {
    pub fn new(endpoint: &str, max_connections_per_host: usize, timeout_ms: u64) -> ClientResult<Self> {
        let mut base = url::Url::parse(endpoint)?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .pool_max_idle_per_host(max_connections_per_host.max(1))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base
    }

    fn resource_url(&self, kind: &str, name: &str) -> url::Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(kind).push(name);
        }
        url
    }

    async fn exists(&self, url: url::Url) -> ClientResult<bool> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(true)
    }

    async fn create<T: Serialize + ?Sized>(
        &self,
        resource: &'static str,
        name: &str,
        url: url::Url,
        body: &T,
    ) -> ClientResult<()> {
        let response = self.client.put(url.clone()).json(body).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(ClientError::CreateFailed {
                resource,
                name: name.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus {
                method: "PUT",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

impl QueueService for HttpQueueClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn ensure_queue<'a>(
        &'a self,
        name: &'a str,
        max_workers: u32,
    ) -> BoxFuture<'a, ClientResult<Ensured>> {
        Box::pin(async move {
            let url = self.resource_url("queue", name);
            if self.exists(url.clone()).await? {
                return Ok(Ensured::Existing);
            }

            let queue = Queue {
                polling_interval: QUEUE_POLLING_INTERVAL,
                max_workers,
            };
            self.create("queue", name, url, &queue).await?;
            Ok(Ensured::Created)
        })
    }

    fn ensure_routing<'a>(
        &'a self,
        name: &'a str,
        category: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<Ensured>> {
        Box::pin(async move {
            let url = self.resource_url("routing", name);
            if self.exists(url.clone()).await? {
                return Ok(Ensured::Existing);
            }

            let routing = Routing {
                queue_name: name.to_string(),
                job_category: category.map(str::to_string),
            };
            self.create("routing", name, url, &routing).await?;
            Ok(Ensured::Created)
        })
    }

    fn submit<'a>(&'a self, name: &'a str, job: &'a Job) -> BoxFuture<'a, ClientResult<Job>> {
        Box::pin(async move {
            let url = self.resource_url("job", name);
            let response = self.client.post(url.clone()).json(job).send().await?;
            let status = response.status();

            if !status.is_success() {
                return Err(ClientError::UnexpectedStatus {
                    method: "POST",
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await?;
            let enqueued: Job = serde_json::from_slice(&body)?;
            Ok(enqueued)
        })
    }
}

/// In-process stand-in for the queue service.
///
/// Accepts every job, assigns sequential ids and dispatches the payload to
/// the job's callback URL on a background task, retrying failed callbacks
/// up to `max_retries` times.
pub struct MockQueueService {
    dispatcher: reqwest::Client,
    dispatch_delay_ms: u64,
    next_id: AtomicU64,
    queues: Mutex<HashMap<String, Queue>>,
    routings: Mutex<HashMap<String, Routing>>,
}

impl MockQueueService {
    pub fn new(dispatch_delay_ms: u64) -> Self {
        Self {
            dispatcher: reqwest::Client::new(),
            dispatch_delay_ms,
            next_id: AtomicU64::new(1),
            queues: Mutex::new(HashMap::new()),
            routings: Mutex::new(HashMap::new()),
        }
    }

    /// Number of jobs accepted so far.
    pub fn submitted(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    pub async fn queue(&self, name: &str) -> Option<Queue> {
        self.queues.lock().await.get(name).cloned()
    }

    pub async fn routing(&self, name: &str) -> Option<Routing> {
        self.routings.lock().await.get(name).cloned()
    }
}

impl Default for MockQueueService {
    fn default() -> Self {
        Self::new(0)
    }
}

impl QueueService for MockQueueService {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn ensure_queue<'a>(
        &'a self,
        name: &'a str,
        max_workers: u32,
    ) -> BoxFuture<'a, ClientResult<Ensured>> {
        Box::pin(async move {
            let mut queues = self.queues.lock().await;
            if queues.contains_key(name) {
                return Ok(Ensured::Existing);
            }
            queues.insert(
                name.to_string(),
                Queue {
                    polling_interval: QUEUE_POLLING_INTERVAL,
                    max_workers,
                },
            );
            Ok(Ensured::Created)
        })
    }

    fn ensure_routing<'a>(
        &'a self,
        name: &'a str,
        category: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<Ensured>> {
        Box::pin(async move {
            let mut routings = self.routings.lock().await;
            if routings.contains_key(name) {
                return Ok(Ensured::Existing);
            }
            routings.insert(
                name.to_string(),
                Routing {
                    queue_name: name.to_string(),
                    job_category: category.map(str::to_string),
                },
            );
            Ok(Ensured::Created)
        })
    }

    fn submit<'a>(&'a self, name: &'a str, job: &'a Job) -> BoxFuture<'a, ClientResult<Job>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut enqueued = job.clone();
            enqueued.id = Some(id);
            enqueued.queue_name = Some(name.to_string());

            let dispatcher = self.dispatcher.clone();
            let delay = Duration::from_millis(self.dispatch_delay_ms);
            let dispatched = enqueued.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                dispatch(&dispatcher, &dispatched).await;
            });

            Ok(enqueued)
        })
    }
}

async fn dispatch(client: &reqwest::Client, job: &Job) {
    let job_id = job.id.unwrap_or_default();
    let mut attempt = 0u32;

    loop {
        let outcome = match client.post(&job.url).json(&job.payload).send().await {
            Ok(response) => match response.json::<JobResult>().await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("Job {} callback returned an unreadable result: {}", job_id, e);
                    None
                }
            },
            Err(e) => {
                warn!("Job {} callback failed: {}", job_id, e);
                None
            }
        };

        let retryable = match &outcome {
            Some(result) => {
                debug!("Job {} attempt {} -> {:?}", job_id, attempt, result.status);
                result.status == JobStatus::Failure
            }
            None => true,
        };

        if !retryable || attempt >= job.max_retries {
            if retryable {
                info!("Job {} gave up after {} attempt(s)", job_id, attempt + 1);
            }
            return;
        }

        attempt += 1;
        sleep(Duration::from_secs(job.retry_delay)).await;
    }
}
