use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use job_sync::{
    AbortSignal, BackendClient, Health, JobStatus, JobsBackend, ReconnectSettings, Snapshot,
    StreamConnection, StreamState, StreamUpdate, Subscription, SyncConfig, SyncCoordinator,
    SyncError, SyncHandle,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const PREFIX: &str = "/api/prompt-learning/online";
const TOKEN: &str = "sk-test";

#[derive(Default)]
struct MockBackend {
    events: Mutex<Vec<Value>>,
    // end the stream body after the backlog instead of holding it open
    end_streams: Mutex<bool>,
    stream_requests: Mutex<Vec<u64>>,
    rejected_auth: Mutex<usize>,
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since_seq: u64,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    since_seq: u64,
}

fn authorized(mock: &MockBackend, headers: &HeaderMap) -> bool {
    let ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(&format!("Bearer {TOKEN}")[..]);
    if !ok {
        *mock.rejected_auth.lock() += 1;
    }
    ok
}

fn seq_of(event: &Value) -> u64 {
    event["seq"].as_u64().unwrap_or(0)
}

async fn list_jobs(State(mock): State<Arc<MockBackend>>, headers: HeaderMap) -> Response {
    if !authorized(&mock, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "jobs": [
            {"job_id": "pl_1", "status": "running", "job_type": "prompt_learning", "created_at": "2024-05-01T10:00:00Z"},
            {"id": "pl_2", "status": "succeeded", "best_score": 0.91},
            {"status": "running"}
        ]
    }))
    .into_response()
}

async fn job_detail(Path(job_id): Path<String>) -> Response {
    match job_id.as_str() {
        "pl_1" => Json(json!({"job": {"job_id": "pl_1", "status": "in_progress", "best_reward": 0.42}}))
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "job not found").into_response(),
    }
}

async fn job_metrics(Path(_job_id): Path<String>) -> Json<Value> {
    Json(json!({"best_reward": 0.42, "rollouts": 128}))
}

async fn events_page(
    State(mock): State<Arc<MockBackend>>,
    Path(_job_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(usize::MAX);
    let page: Vec<Value> = mock
        .events
        .lock()
        .iter()
        .filter(|event| seq_of(event) > query.since_seq)
        .take(limit)
        .cloned()
        .collect();
    Json(json!({ "events": page }))
}

async fn events_stream(
    State(mock): State<Arc<MockBackend>>,
    Path(_job_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    mock.stream_requests.lock().push(query.since_seq);
    let backlog: Vec<Value> = mock
        .events
        .lock()
        .iter()
        .filter(|event| seq_of(event) > query.since_seq)
        .cloned()
        .collect();

    let mut chunks = vec![Bytes::from_static(b": connected\r\n\r\n")];
    for event in backlog {
        let payload = event.to_string();
        let (head, tail) = payload.split_at(payload.len() / 2);
        // two data lines plus a chunk boundary inside the frame
        let kind = event["type"].as_str().unwrap_or("message");
        chunks.push(Bytes::from(format!("event: {kind}\ndata: {head}\n")));
        chunks.push(Bytes::from(format!("data: {tail}\n\n")));
    }
    let body = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
    let body = if *mock.end_streams.lock() {
        body.boxed()
    } else {
        body.chain(stream::pending()).boxed()
    };
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn start_backend(mock: Arc<MockBackend>) -> String {
    let router = Router::new()
        .route(&format!("{PREFIX}/jobs"), get(list_jobs))
        .route(&format!("{PREFIX}/jobs/:job_id"), get(job_detail))
        .route(&format!("{PREFIX}/jobs/:job_id/metrics"), get(job_metrics))
        .route(&format!("{PREFIX}/jobs/:job_id/events"), get(events_page))
        .route(
            &format!("{PREFIX}/jobs/:job_id/events/stream"),
            get(events_stream),
        )
        .with_state(mock);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

fn event(seq: u64, kind: &str, message: &str) -> Value {
    json!({
        "job_id": "pl_1",
        "seq": seq,
        "ts": "2024-05-01T10:00:00Z",
        "type": kind,
        "level": "info",
        "message": message,
        "data": {"step": seq}
    })
}

fn fast_config(base_url: &str) -> SyncConfig {
    let mut config = SyncConfig::new(base_url, TOKEN).expect("config");
    config.job_poll.base = Duration::from_millis(100);
    config.job_poll.max = Duration::from_millis(400);
    config.event_poll.base = Duration::from_millis(50);
    config.event_poll.max = Duration::from_millis(200);
    config.reconnect = ReconnectSettings {
        base: Duration::from_millis(20),
        max: Duration::from_millis(200),
        grace: Duration::from_secs(2),
    };
    config
}

async fn wait_for(handle: &SyncHandle, mut check: impl FnMut(&Snapshot) -> bool) -> Snapshot {
    let mut rx = handle.subscribe();
    loop {
        {
            let snapshot = rx.borrow_and_update();
            if check(&snapshot) {
                return snapshot.clone();
            }
        }
        rx.changed().await.expect("coordinator alive");
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn client_decodes_job_endpoints() {
    let base = start_backend(Arc::new(MockBackend::default())).await;
    let client = BackendClient::new(&fast_config(&base)).expect("client");

    let jobs = client.list_jobs(50).await.expect("jobs");
    let ids: Vec<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
    assert_eq!(ids, vec!["pl_1", "pl_2"]);
    assert_eq!(jobs[1].status, JobStatus::Completed);
    assert_eq!(jobs[1].best_reward, Some(0.91));

    let job = client.job("pl_1").await.expect("job");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.best_reward, Some(0.42));

    let metrics = client.job_metrics("pl_1").await.expect("metrics");
    assert_eq!(metrics["rollouts"], json!(128));
}

#[test_timeout::tokio_timeout_test(20)]
async fn client_surfaces_status_and_auth_failures() {
    let mock = Arc::new(MockBackend::default());
    let base = start_backend(mock.clone()).await;

    let client = BackendClient::new(&fast_config(&base)).expect("client");
    match client.job("pl_404").await {
        Err(SyncError::UnexpectedStatus { status, body }) => {
            assert_eq!(status.as_u16(), 404);
            assert_eq!(body, "job not found");
        }
        other => panic!("expected status error, got {other:?}"),
    }

    let config = SyncConfig::new(&base, "sk-wrong").expect("config");
    let client = BackendClient::new(&config).expect("client");
    assert!(matches!(
        client.list_jobs(10).await,
        Err(SyncError::UnexpectedStatus { .. })
    ));
    assert_eq!(*mock.rejected_auth.lock(), 1);
}

#[test_timeout::tokio_timeout_test(20)]
async fn stream_connection_reads_split_frames_and_resumes() {
    let mock = Arc::new(MockBackend::default());
    *mock.events.lock() = vec![
        event(1, "prompt.learning.progress", "step 1"),
        event(2, "prompt.learning.progress", "step 2"),
    ];
    *mock.end_streams.lock() = true;
    let base = start_backend(mock.clone()).await;
    let config = fast_config(&base);
    let backend: Arc<dyn JobsBackend> = Arc::new(BackendClient::new(&config).expect("client"));

    let (tx, mut rx) = mpsc::channel(64);
    let (_logged_tx, logged) = watch::channel(None);
    let connection = StreamConnection::new(
        backend,
        Subscription::new("pl_1", 0),
        logged,
        1,
        config.reconnect,
        tx,
    );
    let (token, signal) = AbortSignal::detached();
    let task = tokio::spawn(connection.run(signal));

    let mut delivered = Vec::new();
    let mut reconnects = 0;
    while reconnects < 2 {
        let envelope = rx.recv().await.expect("update");
        match envelope.update {
            StreamUpdate::Delivered(event) => {
                assert_eq!(event.job_id, "pl_1");
                delivered.push((event.seq, event.message));
            }
            StreamUpdate::Reconnecting { .. } => {
                reconnects += 1;
                if reconnects == 1 {
                    mock.events
                        .lock()
                        .push(event(3, "prompt.learning.progress", "step 3"));
                }
            }
            _ => {}
        }
    }
    token.cancel();
    task.await.expect("stream task");

    assert_eq!(
        delivered,
        vec![
            (1, "step 1".to_string()),
            (2, "step 2".to_string()),
            (3, "step 3".to_string()),
        ]
    );
    assert_eq!(mock.stream_requests.lock()[..2], [0, 2]);
}

#[test_timeout::tokio_timeout_test(30)]
async fn coordinator_merges_stream_and_polls_end_to_end() {
    let mock = Arc::new(MockBackend::default());
    *mock.events.lock() = (1..=3)
        .map(|seq| event(seq, "prompt.learning.progress", &format!("step {seq}")))
        .collect();
    let base = start_backend(mock.clone()).await;
    let config = fast_config(&base).with_initial_job(Some("pl_1".into()));
    let handle = SyncCoordinator::connect(config).expect("coordinator");

    let snapshot = wait_for(&handle, |s| {
        s.events.len() == 3 && s.job.is_some() && !s.metrics.is_empty()
    })
    .await;
    assert_eq!(snapshot.selected.as_deref(), Some("pl_1"));
    assert_eq!(snapshot.jobs.len(), 2);
    assert_eq!(snapshot.metrics["rollouts"], json!(128));

    mock.events
        .lock()
        .push(event(4, "prompt.learning.job.completed", "done"));
    let snapshot = wait_for(&handle, |s| s.events.len() == 4).await;
    let seqs: Vec<u64> = snapshot.events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let snapshot = wait_for(&handle, |s| {
        s.health == Health::Healthy && s.stream_state == StreamState::Open
    })
    .await;
    assert_eq!(snapshot.last_error, None);

    handle.shutdown().await.expect("shutdown");
    assert!(matches!(
        handle.refresh().await,
        Err(SyncError::ChannelClosed)
    ));
}
