//! End-to-end worker flows against an in-memory store and local HTTP
//! servers standing in for the downstream API and callback receivers.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;

use drip_common::job::{Batch, Job, JobParams};
use drip_common::liveness::Liveness;
use drip_common::registry::default_registry;
use drip_common::retry::RetryPolicy;
use drip_common::store::{JobStore, MemoryStore, StoreSettings};
use drip_worker::callback::CallbackDispatcher;
use drip_worker::downstream::DownstreamClient;
use drip_worker::worker::DripWorker;

#[derive(Clone)]
struct DownstreamHit {
    at: Instant,
    path: String,
    body: Value,
}

/// Scripted stand-in for the downstream API. Serves queued statuses first,
/// then the default status, always with a JSON body.
#[derive(Clone)]
struct FakeDownstream {
    responses: Arc<Mutex<VecDeque<u16>>>,
    default_status: u16,
    delay: Duration,
    hits: Arc<Mutex<Vec<DownstreamHit>>>,
}

impl FakeDownstream {
    fn ok() -> Self {
        Self::new(&[], 200, Duration::ZERO)
    }

    fn new(responses: &[u16], default_status: u16, delay: Duration) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.iter().copied().collect())),
            default_status,
            delay,
            hits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    fn hit_times(&self) -> Vec<Instant> {
        self.hits.lock().unwrap().iter().map(|hit| hit.at).collect()
    }

    async fn start(&self) -> SocketAddr {
        let app = Router::new().fallback(downstream_handler).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn downstream_handler(
    State(fake): State<FakeDownstream>,
    uri: Uri,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.hits.lock().unwrap().push(DownstreamHit {
        at: Instant::now(),
        path: uri.path().to_owned(),
        body,
    });

    if !fake.delay.is_zero() {
        tokio::time::sleep(fake.delay).await;
    }

    let status = fake
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(fake.default_status);
    (
        StatusCode::from_u16(status).unwrap(),
        Json(json!({"profile": {"headline": "works"}})),
    )
}

/// Records callback deliveries; optionally always fails.
#[derive(Clone)]
struct FakeReceiver {
    status: u16,
    deliveries: Arc<Mutex<Vec<(Value, Option<String>)>>>,
}

impl FakeReceiver {
    fn with_status(status: u16) -> Self {
        Self {
            status,
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    async fn start(&self) -> String {
        let app = Router::new().fallback(receiver_handler).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hooks/results", addr)
    }
}

async fn receiver_handler(
    State(receiver): State<FakeReceiver>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let attempt = headers
        .get("x-attempt")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    receiver.deliveries.lock().unwrap().push((body, attempt));
    StatusCode::from_u16(receiver.status).unwrap()
}

struct WorkerHarness {
    store: Arc<MemoryStore>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spin a worker with test-scale intervals: drip and retry delays in tens
/// of milliseconds instead of seconds.
fn start_worker(
    store: Arc<MemoryStore>,
    downstream_addr: SocketAddr,
    drip: Duration,
    downstream_retries: u32,
    callback_retries: u32,
) -> WorkerHarness {
    let downstream = DownstreamClient::new(
        &format!("http://{}", downstream_addr),
        "test-key",
        Duration::from_secs(2),
        downstream_retries,
        RetryPolicy::new(2, Duration::from_millis(10), None, 0.0),
    );
    let callbacks = Arc::new(CallbackDispatcher::new(
        Duration::from_secs(2),
        callback_retries,
        RetryPolicy::new(2, Duration::from_millis(10), None, 0.0),
    ));

    let worker = DripWorker::new(
        store.clone(),
        default_registry(),
        downstream,
        callbacks,
        drip,
        Duration::from_millis(20),
        Duration::from_secs(10),
        RetryPolicy::new(2, Duration::from_millis(30), None, 0.0),
        Duration::from_secs(2),
        Liveness::new(Duration::from_secs(60)),
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await.unwrap();
    });

    WorkerHarness {
        store,
        shutdown,
        handle,
    }
}

fn profile_job(job_id: &str, batch_id: &str) -> Job {
    let mut params = JobParams::new();
    params.insert("user".to_owned(), json!("https://linkedin.com/in/x"));
    let mut job = Job::new(
        job_id.to_owned(),
        "get_linkedin_profile".to_owned(),
        params,
        format!("row_{job_id}"),
        5,
        3,
    );
    job.batch_id = Some(batch_id.to_owned());
    job
}

async fn seed_batch(store: &MemoryStore, batch_id: &str, jobs: Vec<Job>) {
    let batch = Batch::new(
        batch_id.to_owned(),
        "get_linkedin_profile".to_owned(),
        jobs.len() as u64,
    );
    store.create_batch(&batch).await.unwrap();
    store.push_bulk(jobs).await.unwrap();
}

async fn wait_for_batch_done(store: &MemoryStore, batch_id: &str, timeout: Duration) -> Batch {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(batch) = store.get_batch(batch_id).await.unwrap() {
            if batch.is_done() {
                return batch;
            }
        }
        assert!(
            Instant::now() < deadline,
            "batch {batch_id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_happy_path_completes_job_end_to_end() {
    let downstream = FakeDownstream::ok();
    let addr = downstream.start().await;
    let receiver = FakeReceiver::with_status(200);
    let callback_url = receiver.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    let mut job = profile_job("job_1", "batch_1");
    job.callback_url = Some(callback_url);
    seed_batch(&store, "batch_1", vec![job]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(50), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.completed, 1);
    assert_eq!(batch.failed, 0);

    // One downstream POST, to the tool's endpoint, with the params verbatim.
    let hits = downstream.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/api/linkedin/profile");
    assert_eq!(hits[0].body, json!({"user": "https://linkedin.com/in/x"}));

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].row_id, "row_job_1");
    assert_eq!(results[0].status.as_str(), "completed");
    assert_eq!(results[0].attempts, 1);
    assert_eq!(
        results[0].data,
        Some(json!({"profile": {"headline": "works"}}))
    );

    // Callback delivery is asynchronous; give it a moment.
    let deadline = Instant::now() + Duration::from_secs(2);
    while receiver.delivery_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let deliveries = receiver.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (payload, attempt) = &deliveries[0];
    assert_eq!(payload["job_id"], "job_1");
    assert_eq!(payload["row_id"], "row_job_1");
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["tool"], "get_linkedin_profile");
    assert_eq!(attempt.as_deref(), Some("1"));

    harness.shutdown.send(true).ok();
    drop(harness);
}

#[tokio::test]
async fn test_drip_pacing_spaces_execution_starts() {
    let downstream = FakeDownstream::ok();
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    seed_batch(
        &store,
        "batch_1",
        vec![
            profile_job("job_1", "batch_1"),
            profile_job("job_2", "batch_1"),
            profile_job("job_3", "batch_1"),
        ],
    )
    .await;

    let drip = Duration::from_millis(200);
    let harness = start_worker(store.clone(), addr, drip, 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(5)).await;
    assert_eq!(batch.completed, 3);

    let times = downstream.hit_times();
    assert_eq!(times.len(), 3);
    // Start-to-start spacing never dips below the drip interval (small
    // tolerance for timer granularity).
    let floor = drip - Duration::from_millis(15);
    assert!(times[1] - times[0] >= floor, "second start came too early");
    assert!(times[2] - times[1] >= floor, "third start came too early");

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_retry_exhaustion_fails_job_and_notifies() {
    // Every execution sees a 503; internal retries are disabled so each
    // scheduler attempt is exactly one request.
    let downstream = FakeDownstream::new(&[], 503, Duration::ZERO);
    let addr = downstream.start().await;
    let receiver = FakeReceiver::with_status(200);
    let callback_url = receiver.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    let mut job = profile_job("job_1", "batch_1");
    job.callback_url = Some(callback_url);
    seed_batch(&store, "batch_1", vec![job]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 1, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(5)).await;
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.completed, 0);

    // One request per scheduler attempt, budget of three.
    assert_eq!(downstream.hit_count(), 3);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status.as_str(), "failed");
    assert_eq!(results[0].attempts, 3);
    assert!(results[0].error.as_ref().unwrap().contains("503"));

    let deadline = Instant::now() + Duration::from_secs(2);
    while receiver.delivery_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let deliveries = receiver.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0["status"], "failed");
    assert_eq!(deliveries[0].0["attempts"], 3);

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_callback_failure_does_not_touch_job_status() {
    let downstream = FakeDownstream::ok();
    let addr = downstream.start().await;
    let receiver = FakeReceiver::with_status(500);
    let callback_url = receiver.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    let mut job = profile_job("job_1", "batch_1");
    job.callback_url = Some(callback_url);
    seed_batch(&store, "batch_1", vec![job]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.completed, 1);
    assert_eq!(batch.failed, 0);

    // The dispatcher retries three times against the broken receiver and
    // gives up; the job stays completed and nothing is re-queued.
    let deadline = Instant::now() + Duration::from_secs(2);
    while receiver.delivery_count() < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(receiver.delivery_count(), 3);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results[0].status.as_str(), "completed");
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.delayed, 0);

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_unknown_tool_fails_without_downstream_call() {
    let downstream = FakeDownstream::ok();
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    let mut job = profile_job("job_1", "batch_1");
    job.tool = "nope".to_owned();
    seed_batch(&store, "batch_1", vec![job]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.failed, 1);
    assert_eq!(downstream.hit_count(), 0);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results[0].attempts, 1);
    assert!(results[0].error.as_ref().unwrap().contains("unknown tool"));

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_missing_param_fails_only_that_job() {
    let downstream = FakeDownstream::ok();
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    let mut bad = profile_job("job_bad", "batch_1");
    bad.params = JobParams::new();
    let good = profile_job("job_good", "batch_1");
    seed_batch(&store, "batch_1", vec![bad, good]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.completed, 1);
    assert_eq!(batch.failed, 1);

    // Only the valid job reached the downstream API.
    assert_eq!(downstream.hit_count(), 1);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    let failed = results
        .iter()
        .find(|record| record.job_id == "job_bad")
        .unwrap();
    assert!(failed
        .error
        .as_ref()
        .unwrap()
        .contains("missing required parameters"));

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_client_error_is_terminal_on_first_attempt() {
    let downstream = FakeDownstream::new(&[404], 200, Duration::ZERO);
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    seed_batch(&store, "batch_1", vec![profile_job("job_1", "batch_1")]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.failed, 1);
    assert_eq!(downstream.hit_count(), 1);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results[0].attempts, 1);
    assert!(results[0].error.as_ref().unwrap().contains("404"));

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_transient_rate_limit_does_not_consume_attempt_budget() {
    // 429 twice, then success: the downstream client absorbs these inside
    // one scheduler attempt.
    let downstream = FakeDownstream::new(&[429, 429], 200, Duration::ZERO);
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    seed_batch(&store, "batch_1", vec![profile_job("job_1", "batch_1")]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    let batch = wait_for_batch_done(&store, "batch_1", Duration::from_secs(3)).await;
    assert_eq!(batch.completed, 1);
    assert_eq!(downstream.hit_count(), 3);

    let results = store.results_for_batch("batch_1", 10).await.unwrap();
    assert_eq!(results[0].attempts, 1);

    harness.shutdown.send(true).ok();
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_inflight_job() {
    let downstream = FakeDownstream::new(&[], 200, Duration::from_millis(300));
    let addr = downstream.start().await;

    let store = Arc::new(MemoryStore::new(StoreSettings::default()));
    seed_batch(&store, "batch_1", vec![profile_job("job_1", "batch_1")]).await;

    let harness = start_worker(store.clone(), addr, Duration::from_millis(30), 3, 3);

    // Wait until the job is in flight, then ask for shutdown mid-call.
    let deadline = Instant::now() + Duration::from_secs(2);
    while downstream.hit_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(downstream.hit_count(), 1);
    harness.shutdown.send(true).ok();

    // The worker finishes the in-flight job within the grace period and
    // exits on its own.
    tokio::time::timeout(Duration::from_secs(2), harness.handle)
        .await
        .expect("worker did not stop in time")
        .unwrap();

    let batch = harness.store.get_batch("batch_1").await.unwrap().unwrap();
    assert_eq!(batch.completed, 1);
}
