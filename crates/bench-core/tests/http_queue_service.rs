use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bench_core::{
    Benchmark, CallbackSink, ClientError, Config, Ensured, HttpQueueClient, Job, Payload,
    QueueService, SinkConfig,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeState {
    queues: HashMap<String, Value>,
    routings: HashMap<String, Value>,
    next_job_id: u64,
    reject_creates: bool,
}

type Shared = Arc<Mutex<FakeState>>;

struct FakeService {
    base_url: String,
    state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeService {
    async fn spawn(reject_creates: bool) -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState {
            reject_creates,
            ..Default::default()
        }));

        let app = Router::new()
            .route("/queue/:name", get(get_queue).put(put_queue))
            .route("/routing/:name", get(get_routing).put(put_routing))
            .route("/job/:name", post(post_job))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        }
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_queue(State(state): State<Shared>, Path(name): Path<String>) -> StatusCode {
    if state.lock().await.queues.contains_key(&name) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_queue(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let mut state = state.lock().await;
    if state.reject_creates {
        return StatusCode::BAD_REQUEST;
    }
    state.queues.insert(name, body);
    StatusCode::OK
}

async fn get_routing(State(state): State<Shared>, Path(name): Path<String>) -> StatusCode {
    if state.lock().await.routings.contains_key(&name) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_routing(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let mut state = state.lock().await;
    if state.reject_creates {
        return StatusCode::BAD_REQUEST;
    }
    state.routings.insert(name, body);
    StatusCode::OK
}

/// Accepts the job and calls its url back with the payload, like a real dispatcher.
async fn post_job(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Json(mut job): Json<Value>,
) -> Json<Value> {
    let id = {
        let mut state = state.lock().await;
        state.next_job_id += 1;
        state.next_job_id
    };
    job["id"] = Value::from(id);
    job["queue_name"] = Value::from(name);

    let url = job["url"].as_str().unwrap_or_default().to_string();
    let payload = job["payload"].clone();
    tokio::spawn(async move {
        let _ = reqwest::Client::new().post(url).json(&payload).send().await;
    });

    Json(job)
}

#[tokio::test]
async fn ensure_creates_then_reuses() {
    let fake = FakeService::spawn(false).await;
    let client = HttpQueueClient::new(&fake.base_url, 4, 2000).unwrap();

    assert_eq!(client.ensure_queue("bench", 25).await.unwrap(), Ensured::Created);
    assert_eq!(client.ensure_queue("bench", 25).await.unwrap(), Ensured::Existing);
    assert_eq!(
        client.ensure_routing("bench", Some("cat")).await.unwrap(),
        Ensured::Created
    );
    assert_eq!(
        client.ensure_routing("bench", Some("cat")).await.unwrap(),
        Ensured::Existing
    );

    let state = fake.state.lock().await;
    assert_eq!(
        state.queues["bench"],
        serde_json::json!({ "polling_interval": 100, "max_workers": 25 })
    );
    assert_eq!(
        state.routings["bench"],
        serde_json::json!({ "queue_name": "bench", "job_category": "cat" })
    );
}

#[tokio::test]
async fn bad_request_on_create_is_a_creation_failure() {
    let fake = FakeService::spawn(true).await;
    let client = HttpQueueClient::new(&fake.base_url, 1, 2000).unwrap();

    match client.ensure_queue("bench", 10).await {
        Err(ClientError::CreateFailed {
            resource, status, ..
        }) => {
            assert_eq!(resource, "queue");
            assert_eq!(status, 400);
        }
        other => panic!("expected CreateFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn transport_failure_propagates() {
    // Bind and drop a listener to get a port nobody serves.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpQueueClient::new(&format!("http://{}", addr), 1, 2000).unwrap();
    assert!(matches!(
        client.ensure_queue("bench", 10).await,
        Err(ClientError::Transport(_))
    ));
}

#[tokio::test]
async fn submit_returns_assigned_id() {
    let fake = FakeService::spawn(false).await;
    let client = HttpQueueClient::new(&fake.base_url, 1, 2000).unwrap();

    // Nobody listens on the callback url; the fake ignores the dispatch error.
    let job = Job::new("http://127.0.0.1:9/", Payload { id: 11 });
    let enqueued = client.submit("bench", &job).await.unwrap();
    assert_eq!(enqueued.id, Some(1));
    assert_eq!(enqueued.queue_name.as_deref(), Some("bench"));
    assert_eq!(enqueued.payload["id"], 11);
}

#[tokio::test]
async fn benchmark_against_http_service() {
    let fake = FakeService::spawn(false).await;

    let mut config = Config::default();
    config.target.endpoint = fake.base_url.clone();
    config.bench.total_jobs = 100;
    config.bench.concurrency = 10;
    config.bench.drain_timeout_ms = 10_000;
    config.sink = SinkConfig {
        bind: "127.0.0.1:0".to_string(),
        advertise_host: "127.0.0.1".to_string(),
        channel_capacity: 1,
    };
    config.validate().unwrap();

    let (mut sink, completions) = CallbackSink::bind(&config.sink, 0).await.unwrap();
    sink.start().unwrap();

    let client = HttpQueueClient::new(
        &config.target.endpoint,
        config.bench.concurrency as usize,
        config.target.timeout_ms,
    )
    .unwrap();
    let benchmark = Benchmark::new(config, Arc::new(client), sink.callback_url(), sink.stat());
    let report = benchmark.run(completions).await.unwrap();
    sink.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(report.service, "http");
    assert_eq!(report.sent, 100);
    assert_eq!(report.received, 100);
    assert!(!report.drain_timed_out);
    assert!(report.reconciliation.matched, "{}", report.reconciliation);
    assert_eq!(report.stat.total, 100);
    assert_eq!(fake.state.lock().await.next_job_id, 100);
}
