//! XMRpos backend client CLI
//!
//! Commands:
//! - login: authenticate a POS device and store its session
//! - health: probe the backend
//! - rates: show cached or freshly fetched exchange rates
//! - charge: convert a fiat price, create a transaction and wait for acceptance
//! - watch: follow the status of an existing transaction

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xmrpos_backend_client::amount::{fiat_to_atomic, format_xmr, payment_uri};
use xmrpos_backend_client::{Config, PosBackend, RateSnapshot};
use xmrpos_common::{CreateTransactionRequest, FileStore, RateTier, TransactionStatus};

#[derive(Parser)]
#[command(name = "xmrpos-client")]
#[command(about = "Point-of-sale client for the XMRpos transaction backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log a POS device in and store the issued tokens
    Login {
        /// Backend base URL
        #[arg(short, long)]
        url: String,

        /// POS name
        #[arg(short, long)]
        name: String,

        /// POS password
        #[arg(short, long)]
        password: String,

        /// Vendor the POS belongs to
        #[arg(long)]
        vendor_id: u64,
    },

    /// Check backend liveness
    Health,

    /// Show exchange rates for a cache tier
    Rates {
        /// primary, reference or full
        #[arg(short, long, default_value = "full")]
        tier: RateTier,
    },

    /// Charge a fiat amount in the primary currency
    Charge {
        /// Amount in the primary fiat currency
        amount: f64,

        /// Label shown to the payer
        #[arg(short, long, default_value = "XMRpos")]
        description: String,
    },

    /// Follow status updates of a transaction
    Watch {
        /// Transaction id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xmrpos_backend_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = FileStore::open(&config.credentials_path)
        .await
        .with_context(|| format!("Failed to open {}", config.credentials_path.display()))?;
    let backend = PosBackend::new(Arc::new(store), &config)?;

    match cli.command {
        Commands::Login {
            url,
            name,
            password,
            vendor_id,
        } => {
            backend
                .auth
                .login_pos(&url, &name, &password, vendor_id)
                .await?;
            println!("Logged in as '{}' at {}", name, url);
        }
        Commands::Health => {
            let health = backend.transactions.health().await?;
            println!(
                "status={} walletrpc={} postgresql={}",
                health.status, health.services.walletrpc, health.services.postgresql
            );
        }
        Commands::Rates { tier } => {
            let snapshot = match tier {
                RateTier::Primary => backend.rates.primary_rate(&config.primary_fiat_currency).await?,
                RateTier::Reference => {
                    backend
                        .rates
                        .reference_rates(&config.reference_fiat_currencies)
                        .await?
                }
                RateTier::Full => backend.rates.all_rates(&config.all_fiat_currencies()).await?,
            };
            print_rates(&config.quote_base_asset, &snapshot);
        }
        Commands::Charge {
            amount,
            description,
        } => charge(&backend, &config, amount, description).await?,
        Commands::Watch { id } => watch(&backend, id).await?,
    }

    Ok(())
}

fn print_rates(base_asset: &str, snapshot: &RateSnapshot) {
    for (currency, rate) in &snapshot.rates {
        println!("1 {} = {:.4} {}", base_asset, rate, currency);
    }
    if snapshot.is_degraded() {
        println!("(provider unavailable, showing cached rates)");
    }
}

async fn charge(backend: &PosBackend, config: &Config, fiat: f64, description: String) -> Result<()> {
    let currency = &config.primary_fiat_currency;
    let rates = backend.rates.primary_rate(currency).await?;
    let rate = rates
        .get(currency)
        .with_context(|| format!("No exchange rate available for {}", currency))?;

    let atomic = fiat_to_atomic(fiat, rate)?;
    info!("Charging {} {} = {} XMR at {}", fiat, currency, format_xmr(atomic), rate);

    let created = backend
        .transactions
        .create_transaction(&CreateTransactionRequest {
            amount: atomic,
            description: Some(description),
            amount_in_currency: fiat,
            currency: currency.clone(),
            required_confirmations: config.required_confirmations,
        })
        .await?;

    println!("Transaction {} created", created.id);
    println!("{}", payment_uri(&created.address, atomic));

    watch(backend, created.id).await
}

/// What the watch loop does with the latest status value
#[derive(Debug, PartialEq)]
enum WatchStep {
    Accepted(TransactionStatus),
    Pending(TransactionStatus),
    /// Nothing received yet
    Waiting,
    /// The stream ended after delivering updates
    Lost,
}

fn next_step(current: Option<TransactionStatus>, seen_update: bool) -> WatchStep {
    match current {
        Some(update) if update.accepted => WatchStep::Accepted(update),
        Some(update) => WatchStep::Pending(update),
        None if seen_update => WatchStep::Lost,
        None => WatchStep::Waiting,
    }
}

async fn watch(backend: &PosBackend, id: i64) -> Result<()> {
    let mut status = backend.transactions.status();
    let subscription = backend.transactions.observe(id).await;
    let mut seen_update = false;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match next_step(current, seen_update) {
                    WatchStep::Accepted(update) => {
                        println!(
                            "Transaction {} accepted: {} XMR, tx {}",
                            update.id,
                            format_xmr(update.amount),
                            update.first_tx_hash().unwrap_or("-")
                        );
                        break;
                    }
                    WatchStep::Pending(update) => {
                        seen_update = true;
                        println!(
                            "Transaction {} pending, {} transfer(s) seen",
                            update.id,
                            update.sub_transactions.len()
                        );
                    }
                    WatchStep::Lost => {
                        warn!("Lost status stream of transaction {}", id);
                        break;
                    }
                    WatchStep::Waiting => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    subscription.cancel().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(accepted: bool) -> TransactionStatus {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "accepted": accepted,
            "amount": 1000,
            "updated_at": "2024-05-01T12:00:00Z",
            "sub_transactions": []
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_before_first_update_keeps_waiting() {
        assert_eq!(next_step(None, false), WatchStep::Waiting);
    }

    #[test]
    fn test_unknown_after_updates_ends_watch() {
        assert_eq!(next_step(None, true), WatchStep::Lost);
    }

    #[test]
    fn test_accepted_and_pending() {
        assert_eq!(next_step(Some(status(true)), true), WatchStep::Accepted(status(true)));
        assert_eq!(next_step(Some(status(false)), false), WatchStep::Pending(status(false)));
    }
}
