//! Transaction creation and live status subscription
//!
//! At most one status subscription is live per client. Starting a new one
//! tears the previous one down (including its socket) before connecting, and
//! the latest received update is published through a `watch` channel.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use xmrpos_common::{
    CreateTransactionRequest, CreateTransactionResponse, Error, HealthResponse, Result,
    TransactionStatus,
};

use crate::amount::validate_confirmations;
use crate::auth::AuthClient;

/// How long a torn-down subscription may take to close its socket
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type StatusStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Latest status of the observed transaction, `None` when unknown
pub type StatusReceiver = watch::Receiver<Option<TransactionStatus>>;

#[derive(Clone)]
pub struct TransactionClient {
    inner: Arc<Inner>,
}

struct Inner {
    auth: Arc<AuthClient>,
    status: watch::Sender<Option<TransactionStatus>>,
    active: Mutex<Option<ActiveSubscription>>,
    next_generation: AtomicU64,
}

struct ActiveSubscription {
    transaction_id: i64,
    generation: u64,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Caller-held reference to one status subscription.
///
/// Cancelling a handle only affects the subscription it was issued for; once a
/// newer `observe` call has replaced it, cancelling is a no-op.
#[derive(Debug)]
pub struct SubscriptionHandle {
    transaction_id: i64,
    generation: u64,
    inner: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    /// Stop this subscription. Returns whether it was still live, which is
    /// false once its stream has ended by itself.
    pub async fn cancel(self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.stop(Some(self.generation)).await,
            None => false,
        }
    }
}

impl TransactionClient {
    pub fn new(auth: Arc<AuthClient>) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                auth,
                status,
                active: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.inner.auth
    }

    /// Liveness probe
    pub async fn health(&self) -> Result<HealthResponse> {
        self.inner.auth.get_json("/health").await
    }

    /// Create a payment transaction. Not retried beyond the auth refresh.
    pub async fn create_transaction(
        &self,
        request: &CreateTransactionRequest,
    ) -> Result<CreateTransactionResponse> {
        if request.amount <= 0 {
            return Err(Error::InvalidAmount(format!(
                "transaction amount {} must be positive",
                request.amount
            )));
        }
        validate_confirmations(request.required_confirmations)?;

        let response: CreateTransactionResponse =
            self.inner.auth.post_json("/transactions", request).await?;
        info!(
            "Created transaction {} for {} atomic units ({} {})",
            response.id, request.amount, request.amount_in_currency, request.currency
        );

        Ok(response)
    }

    /// Subscribe to status updates for `transaction_id`, replacing any
    /// subscription that is currently live.
    pub async fn observe(&self, transaction_id: i64) -> SubscriptionHandle {
        info!("Request to observe transaction updates for ID: {}", transaction_id);

        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            debug!(
                "Replacing subscription for transaction {}",
                previous.transaction_id
            );
            teardown(previous).await;
        }
        self.inner.status.send_replace(None);

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.inner.auth),
            self.inner.status.clone(),
            transaction_id,
            shutdown_rx,
        ));

        *active = Some(ActiveSubscription {
            transaction_id,
            generation,
            shutdown,
            task,
        });

        SubscriptionHandle {
            transaction_id,
            generation,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop whatever subscription is live. Safe to call with none active.
    pub async fn stop(&self) {
        self.inner.stop(None).await;
    }

    pub fn status(&self) -> StatusReceiver {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> Option<TransactionStatus> {
        self.inner.status.borrow().clone()
    }

    /// Id of the transaction being observed, `None` once the subscription
    /// was stopped or its stream ended
    pub async fn current_transaction_id(&self) -> Option<i64> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .filter(|active| active.is_live())
            .map(|active| active.transaction_id)
    }
}

impl Inner {
    /// Tear down the live subscription if it matches `generation` (any when `None`).
    async fn stop(&self, generation: Option<u64>) -> bool {
        let mut active = self.active.lock().await;

        let matches = match (active.as_ref(), generation) {
            (Some(current), Some(generation)) => current.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            if generation.is_none() {
                debug!("No active observation to stop");
                self.status.send_replace(None);
            }
            return false;
        }

        let Some(subscription) = active.take() else {
            return false;
        };
        let live = subscription.is_live();
        if live {
            info!(
                "Stopping transaction updates observation for ID: {}",
                subscription.transaction_id
            );
            teardown(subscription).await;
        } else {
            debug!(
                "Subscription for transaction {} had already ended",
                subscription.transaction_id
            );
        }
        self.status.send_replace(None);

        live
    }
}

impl ActiveSubscription {
    /// False once the subscription task exited, on its own or otherwise
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn teardown(mut subscription: ActiveSubscription) {
    // The task may already have exited on its own
    let _ = subscription.shutdown.send(());

    if tokio::time::timeout(CLOSE_TIMEOUT, &mut subscription.task)
        .await
        .is_err()
    {
        warn!(
            "Subscription for transaction {} did not close in time, aborting",
            subscription.transaction_id
        );
        subscription.task.abort();
    }
}

async fn run_subscription(
    auth: Arc<AuthClient>,
    status: watch::Sender<Option<TransactionStatus>>,
    transaction_id: i64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut stream = tokio::select! {
        _ = &mut shutdown => return,
        connected = connect_status_stream(&auth, transaction_id) => match connected {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error observing transaction {}: {}", transaction_id, e);
                status.send_replace(None);
                return;
            }
        },
    };
    info!("Status subscription established for transaction {}", transaction_id);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Client stopped observing".into(),
                };
                if let Err(e) = stream.close(Some(frame)).await {
                    debug!("Error closing status subscription: {}", e);
                }
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    publish(&status, transaction_id, text.as_bytes());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    publish(&status, transaction_id, &bytes);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Backend closed subscription for transaction {}: {:?}", transaction_id, frame);
                    status.send_replace(None);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Subscription for transaction {} dropped: {}", transaction_id, e);
                    status.send_replace(None);
                    break;
                }
                None => {
                    status.send_replace(None);
                    break;
                }
            },
        }
    }

    debug!("Subscription task finished for transaction {}", transaction_id);
}

fn publish(status: &watch::Sender<Option<TransactionStatus>>, transaction_id: i64, raw: &[u8]) {
    match serde_json::from_slice::<TransactionStatus>(raw) {
        Ok(update) if update.id == transaction_id => {
            debug!(
                "Received update for transaction {}: accepted={}",
                transaction_id, update.accepted
            );
            status.send_replace(Some(update));
        }
        Ok(update) => {
            warn!(
                "Ignoring update for transaction {} on subscription for {}",
                update.id, transaction_id
            );
        }
        Err(e) => {
            warn!("Ignoring unreadable status update for transaction {}: {}", transaction_id, e);
        }
    }
}

async fn connect_status_stream(auth: &AuthClient, transaction_id: i64) -> Result<StatusStream> {
    let url = status_url(&auth.base_url().await?, transaction_id)?;
    let token = auth.access_token().await?;

    match tokio_tungstenite::connect_async(handshake_request(&url, &token)?).await {
        Ok((stream, _)) => Ok(stream),
        Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
            debug!("Subscription handshake rejected with 401, refreshing session");
            let token = auth.refresh_after_rejection(&token).await?;
            match tokio_tungstenite::connect_async(handshake_request(&url, &token)?).await {
                Ok((stream, _)) => Ok(stream),
                Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                    Err(Error::Unauthenticated)
                }
                Err(e) => Err(ws_error(e)),
            }
        }
        Err(e) => Err(ws_error(e)),
    }
}

fn handshake_request(url: &str, token: &str) -> Result<Request> {
    let mut request = url.into_client_request().map_err(ws_error)?;
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Other(e.into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Map the backend base URL onto its status stream endpoint
fn status_url(base_url: &str, transaction_id: i64) -> Result<String> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_string()
    } else {
        return Err(Error::Configuration(format!(
            "Unsupported backend URL scheme: {}",
            base_url
        )));
    };

    Ok(format!(
        "{}/transactions/{}/status",
        ws_base.trim_end_matches('/'),
        transaction_id
    ))
}

fn ws_error(e: WsError) -> Error {
    match e {
        WsError::Http(response) => Error::Remote {
            status: response.status().as_u16(),
            body: response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .unwrap_or_default(),
        },
        other => Error::Network(other.to_string()),
    }
}
