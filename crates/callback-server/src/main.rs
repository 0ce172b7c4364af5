//! XMRpos Callback Server
//!
//! Standalone listener that logs every payment notification it receives.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xmrpos_callback_server::{CallbackHandler, CallbackServer, Config};
use xmrpos_common::CallbackEvent;

struct LoggingHandler;

#[async_trait]
impl CallbackHandler for LoggingHandler {
    async fn handle(&self, event: CallbackEvent) {
        info!(
            "Payment {}: {}/{} atomic units covered, fiat value {}, complete={}, {} transfer(s)",
            event.correlation_id,
            event.amount_covered_total,
            event.amount_expected,
            event.fiat_value,
            event.complete,
            event.transactions.len()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xmrpos_callback_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting XMRpos Callback Server");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Callback address: {}", config.callback_address());

    let server = CallbackServer::start(&config.callback_address(), LoggingHandler).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    server.shutdown().await;

    Ok(())
}
