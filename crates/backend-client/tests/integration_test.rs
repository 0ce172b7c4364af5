//! Integration tests for the backend client
//!
//! A fake transaction backend is served in-process with axum on an ephemeral
//! port; it speaks the same HTTP and status-stream protocol as the real one.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xmrpos_backend_client::{AuthClient, StatusReceiver, TransactionClient};
use xmrpos_common::{
    CreateTransactionRequest, Credentials, Error, FileStore, MemoryStore, TokenPair,
    TransactionStatus,
};

/// Status stream that sends one pending update, then drops the connection
const DROPPED_ID: i64 = 99;
/// Status stream that sends a pending then an accepted update
const ACCEPTED_ID: i64 = 7;

#[derive(Clone)]
struct FakeBackend {
    valid_token: Arc<Mutex<String>>,
    refresh_ok: Arc<AtomicBool>,
    refresh_calls: Arc<AtomicUsize>,
    open_streams: Arc<AtomicUsize>,
    normal_closes: Arc<AtomicUsize>,
    created: Arc<Mutex<Vec<Value>>>,
}

impl FakeBackend {
    fn new(valid_token: &str) -> Self {
        Self {
            valid_token: Arc::new(Mutex::new(valid_token.to_string())),
            refresh_ok: Arc::new(AtomicBool::new(true)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            open_streams: Arc::new(AtomicUsize::new(0)),
            normal_closes: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some(expected.as_str())
    }
}

async fn health(State(state): State<FakeBackend>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"status": 200, "services": {"walletrpc": true, "postgresql": true}})).into_response()
}

async fn create_transaction(
    State(state): State<FakeBackend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body["description"] == "reject" {
        return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
    }
    state.created.lock().unwrap().push(body);
    Json(json!({"id": ACCEPTED_ID, "address": "4AdUndXHHZ6cfufTMvppY6JwXNouMBzSkbLYfpAV5Usx"}))
        .into_response()
}

async fn refresh(State(state): State<FakeBackend>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    // Keep the refresh in flight long enough for concurrent 401s to pile up
    tokio::time::sleep(Duration::from_millis(100)).await;

    if !state.refresh_ok.load(Ordering::SeqCst) || body["refresh_token"] != "refresh-1" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    *state.valid_token.lock().unwrap() = "access-2".to_string();
    Json(json!({"access_token": "access-2", "refresh_token": "refresh-2"})).into_response()
}

async fn status_stream(
    State(state): State<FakeBackend>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_status(socket, state, id))
}

fn status_message(id: i64, accepted: bool) -> Message {
    let body = json!({
        "id": id,
        "accepted": accepted,
        "amount": 1_000_000_000_000i64,
        "updated_at": "2024-05-01T12:00:00Z",
        "sub_transactions": if accepted { json!([{"tx_hash": "abc123"}]) } else { json!([]) }
    });
    Message::Text(body.to_string().into())
}

async fn serve_status(mut socket: WebSocket, state: FakeBackend, id: i64) {
    state.open_streams.fetch_add(1, Ordering::SeqCst);

    let _ = socket.send(status_message(id, false)).await;

    if id == DROPPED_ID {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.open_streams.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    if id == ACCEPTED_ID {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = socket.send(status_message(id, true)).await;
    }

    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Close(frame) = message {
            if frame.map(|f| f.code) == Some(1000) {
                state.normal_closes.fetch_add(1, Ordering::SeqCst);
            }
            break;
        }
    }

    state.open_streams.fetch_sub(1, Ordering::SeqCst);
}

async fn spawn_backend(state: FakeBackend) -> String {
    let app = Router::new()
        .route("/health", get(health))
        .route("/transactions", post(create_transaction))
        .route("/transactions/{id}/status", get(status_stream))
        .route("/auth/refresh", post(refresh))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

async fn client(base_url: &str, access_token: &str) -> (Arc<AuthClient>, Credentials) {
    let credentials = Credentials::new(Arc::new(MemoryStore::new()));
    credentials.set_backend_url(base_url).await.unwrap();
    credentials
        .save_tokens(&TokenPair {
            access_token: access_token.to_string(),
            refresh_token: "refresh-1".to_string(),
        })
        .await
        .unwrap();

    let auth = AuthClient::new(credentials.clone(), Duration::from_secs(5)).unwrap();
    (Arc::new(auth), credentials)
}

async fn wait_for_status<F>(status: &mut StatusReceiver, predicate: F) -> Option<TransactionStatus>
where
    F: Fn(&Option<TransactionStatus>) -> bool,
{
    let value = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
    (*value).clone()
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

fn charge_request(description: &str) -> CreateTransactionRequest {
    CreateTransactionRequest {
        amount: 1_000_000_000_000,
        description: Some(description.to_string()),
        amount_in_currency: 150.0,
        currency: "USD".to_string(),
        required_confirmations: 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let backend = FakeBackend::new("access-2");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, credentials) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let transactions = transactions.clone();
        tasks.push(tokio::spawn(async move { transactions.health().await }));
    }
    for task in tasks {
        let health = task.await.unwrap().expect("request should succeed after refresh");
        assert_eq!(health.status, 200);
    }

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        credentials.access_token().await.unwrap().as_deref(),
        Some("access-2")
    );
    assert_eq!(
        credentials.refresh_token().await.unwrap().as_deref(),
        Some("refresh-2")
    );
}

#[tokio::test]
async fn test_failed_refresh_clears_session() {
    let backend = FakeBackend::new("access-2");
    backend.refresh_ok.store(false, Ordering::SeqCst);
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, credentials) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let result = transactions.health().await;
    assert!(matches!(result, Err(Error::Unauthenticated)));
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(credentials.access_token().await.unwrap().is_none());
    assert!(credentials.refresh_token().await.unwrap().is_none());

    // Without a refresh token no further refresh is attempted
    let again = transactions.health().await;
    assert!(matches!(again, Err(Error::Unauthenticated)));
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_transaction() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let created = transactions
        .create_transaction(&charge_request("XMRpos"))
        .await
        .unwrap();
    assert_eq!(created.id, ACCEPTED_ID);

    let bodies = backend.created.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["amount"], 1_000_000_000_000i64);
    assert_eq!(bodies[0]["currency"], "USD");
    assert_eq!(bodies[0]["required_confirmations"], 0);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_transaction_remote_rejection() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    match transactions.create_transaction(&charge_request("reject")).await {
        Err(Error::Remote { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "Invalid request body");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_create_transaction_rejects_invalid_locally() {
    let (auth, _) = client("http://127.0.0.1:1", "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut request = charge_request("XMRpos");
    request.required_confirmations = 11;
    assert!(matches!(
        transactions.create_transaction(&request).await,
        Err(Error::Configuration(_))
    ));

    request.required_confirmations = 0;
    request.amount = 0;
    assert!(matches!(
        transactions.create_transaction(&request).await,
        Err(Error::InvalidAmount(_))
    ));
}

#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    let (auth, _) = client("http://127.0.0.1:1", "access-1").await;
    let transactions = TransactionClient::new(auth);

    let result = transactions.health().await;
    assert!(matches!(result, Err(Error::Network(_))));
}

#[tokio::test]
async fn test_observe_delivers_latest_status() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut status = transactions.status();
    let handle = transactions.observe(ACCEPTED_ID).await;
    assert_eq!(handle.transaction_id(), ACCEPTED_ID);
    assert_eq!(transactions.current_transaction_id().await, Some(ACCEPTED_ID));

    let accepted = wait_for_status(&mut status, |s| {
        s.as_ref().map(|s| s.accepted).unwrap_or(false)
    })
    .await
    .unwrap();
    assert_eq!(accepted.id, ACCEPTED_ID);
    assert_eq!(accepted.first_tx_hash(), Some("abc123"));

    assert!(handle.cancel().await);
    assert!(transactions.current_status().is_none());
    assert!(transactions.current_transaction_id().await.is_none());

    let closes = backend.normal_closes.clone();
    eventually(move || closes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_observe_replaces_previous_subscription() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut status = transactions.status();
    let first = transactions.observe(1).await;
    wait_for_status(&mut status, |s| s.as_ref().map(|s| s.id) == Some(1)).await;

    let second = transactions.observe(2).await;
    assert_ne!(transactions.current_status().map(|s| s.id), Some(1));

    let latest = wait_for_status(&mut status, |s| s.as_ref().map(|s| s.id) == Some(2))
        .await
        .unwrap();
    assert_eq!(latest.id, 2);

    let closes = backend.normal_closes.clone();
    eventually(move || closes.load(Ordering::SeqCst) == 1).await;
    let open = backend.open_streams.clone();
    eventually(move || open.load(Ordering::SeqCst) == 1).await;

    // A handle that was already replaced cannot stop the newer subscription
    assert!(!first.cancel().await);
    assert_eq!(transactions.current_transaction_id().await, Some(2));

    assert!(second.cancel().await);
    let open = backend.open_streams.clone();
    eventually(move || open.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    transactions.stop().await;

    let mut status = transactions.status();
    transactions.observe(3).await;
    wait_for_status(&mut status, |s| s.is_some()).await;

    transactions.stop().await;
    transactions.stop().await;
    assert!(transactions.current_status().is_none());

    let closes = backend.normal_closes.clone();
    eventually(move || closes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_dropped_subscription_clears_status() {
    let backend = FakeBackend::new("access-1");
    let base_url = spawn_backend(backend).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut status = transactions.status();
    let handle = transactions.observe(DROPPED_ID).await;

    wait_for_status(&mut status, |s| s.is_some()).await;
    let cleared = wait_for_status(&mut status, |s| s.is_none()).await;
    assert!(cleared.is_none());

    // The ended subscription no longer counts as observing anything
    let mut ended = false;
    for _ in 0..100 {
        if transactions.current_transaction_id().await.is_none() {
            ended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ended);
    assert!(!handle.cancel().await);
    assert!(transactions.current_status().is_none());
}

#[tokio::test]
async fn test_refreshed_session_persists_in_file_store() {
    let backend = FakeBackend::new("access-2");
    let base_url = spawn_backend(backend.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");

    {
        let store = FileStore::open(&path).await.unwrap();
        let credentials = Credentials::new(Arc::new(store));
        credentials.set_backend_url(&base_url).await.unwrap();
        credentials
            .save_tokens(&TokenPair {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
            })
            .await
            .unwrap();

        let auth = AuthClient::new(credentials, Duration::from_secs(5)).unwrap();
        let transactions = TransactionClient::new(Arc::new(auth));
        let health = transactions.health().await.unwrap();
        assert_eq!(health.status, 200);
    }

    // A fresh process reads the rotated tokens back and needs no refresh
    let reopened = Credentials::new(Arc::new(FileStore::open(&path).await.unwrap()));
    assert_eq!(
        reopened.access_token().await.unwrap().as_deref(),
        Some("access-2")
    );
    assert_eq!(
        reopened.backend_url().await.unwrap().as_deref(),
        Some(base_url.as_str())
    );

    let auth = AuthClient::new(reopened, Duration::from_secs(5)).unwrap();
    TransactionClient::new(Arc::new(auth)).health().await.unwrap();
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscription_handshake_refreshes_token() {
    let backend = FakeBackend::new("access-2");
    let base_url = spawn_backend(backend.clone()).await;
    let (auth, _) = client(&base_url, "access-1").await;
    let transactions = TransactionClient::new(auth);

    let mut status = transactions.status();
    transactions.observe(5).await;

    let update = wait_for_status(&mut status, |s| s.is_some()).await.unwrap();
    assert_eq!(update.id, 5);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);

    transactions.stop().await;
}

#[tokio::test]
async fn test_subscription_to_unreachable_backend_stays_unknown() {
    let (auth, _) = client("http://127.0.0.1:1", "access-1").await;
    let transactions = TransactionClient::new(auth);

    transactions.observe(1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transactions.current_status().is_none());

    transactions.stop().await;
    assert!(transactions.current_transaction_id().await.is_none());
}
