//! XMRpos Callback Server
//!
//! Local HTTP listener receiving payment-completion notifications from the
//! payment processor.
//!
//! ## Protocol
//!
//! - `POST /?fiatValue=<f64>&callbackUUID=<id>` with the JSON notification either
//!   as the raw body or in the `postData` field of a form-encoded body
//! - Every request is answered `200` with a plain-text acknowledgement; parse
//!   failures are logged and never reported back to the sender
//!
//! Parsed events are queued on a channel and handed, one at a time and in
//! arrival order, to a single registered [`CallbackHandler`] running on its own
//! task, so a slow handler never delays the listener.

pub mod config;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method},
    routing::any,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use xmrpos_common::{CallbackEvent, Result};

pub use config::Config;

pub const ACK_PROCESSED: &str = "Callback processed successfully";
pub const ACK_NO_DATA: &str = "No callback data";
pub const ACK_INVALID_METHOD: &str = "Invalid request method";

/// Form field carrying the JSON notification
pub const PAYLOAD_FIELD: &str = "postData";

/// Receiver of parsed callback events.
#[async_trait]
pub trait CallbackHandler: Send + Sync + 'static {
    async fn handle(&self, event: CallbackEvent);
}

/// Adapter turning a plain closure into a [`CallbackHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CallbackHandler for FnHandler<F>
where
    F: Fn(CallbackEvent) + Send + Sync + 'static,
{
    async fn handle(&self, event: CallbackEvent) {
        (self.0)(event)
    }
}

/// Shared router state
#[derive(Clone)]
pub struct AppState {
    events: mpsc::UnboundedSender<CallbackEvent>,
}

/// Create the callback router; parsed events are pushed onto `events`.
pub fn create_router(events: mpsc::UnboundedSender<CallbackEvent>) -> Router {
    let state = AppState { events };

    Router::new()
        .route("/", any(callback_handler))
        .fallback(callback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn callback_handler(
    State(state): State<AppState>,
    method: Method,
    query: std::result::Result<Query<HashMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    if method != Method::POST {
        debug!("Rejecting {} callback request", method);
        return ACK_INVALID_METHOD;
    }

    let Some(payload) = extract_payload(&headers, &body) else {
        return ACK_NO_DATA;
    };

    let params = query.map(|Query(params)| params).unwrap_or_default();
    let fiat_value = params
        .get("fiatValue")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0);
    let correlation_id = params
        .get("callbackUUID")
        .or_else(|| params.get("correlationId"))
        .cloned()
        .unwrap_or_default();

    match CallbackEvent::parse(&payload, fiat_value, correlation_id) {
        Ok(event) => {
            info!(
                "Callback {}: covered {} of {} atomic units",
                event.correlation_id, event.amount_covered_total, event.amount_expected
            );
            if state.events.send(event).is_err() {
                warn!("Callback delivery stopped, dropping event");
            }
        }
        Err(e) => info!("Failed to process callback: {}", e),
    }

    ACK_PROCESSED
}

/// Pull the notification out of the body, `None` when there is nothing to parse
fn extract_payload(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let payload = if is_form {
        let mut fields: HashMap<String, String> = serde_urlencoded::from_bytes(body).ok()?;
        fields.remove(PAYLOAD_FIELD)?
    } else {
        String::from_utf8_lossy(body).into_owned()
    };

    if payload.trim().is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Notification URL for one checkout, with a fresh correlation id.
///
/// Returns the URL and the id it carries.
pub fn callback_url(base_url: &str, fiat_value: f64) -> (String, String) {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let url = format!(
        "{}/?fiatValue={}&callbackUUID={}",
        base_url.trim_end_matches('/'),
        fiat_value,
        correlation_id
    );
    (url, correlation_id)
}

/// Running listener plus its delivery task. Stop it with [`CallbackServer::shutdown`].
pub struct CallbackServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server_task: JoinHandle<()>,
    delivery_task: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind `addr` and start serving; events go to `handler`.
    pub async fn start<H: CallbackHandler>(addr: &str, handler: H) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let delivery_task = tokio::spawn(deliver(events_rx, Arc::new(handler)));

        let app = create_router(events);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Callback server error: {:#}", e);
            }
        });

        info!("Callback server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            server_task,
            delivery_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting callbacks, then let already queued events drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());

        if let Err(e) = self.server_task.await {
            error!("Callback server task failed: {}", e);
        }
        if let Err(e) = self.delivery_task.await {
            error!("Callback delivery task failed: {}", e);
        }

        info!("Callback server on {} stopped", self.local_addr);
    }
}

async fn deliver(mut events: mpsc::UnboundedReceiver<CallbackEvent>, handler: Arc<dyn CallbackHandler>) {
    while let Some(event) = events.recv().await {
        debug!("Delivering callback {}", event.correlation_id);
        handler.handle(event).await;
    }
    debug!("Callback delivery finished");
}
