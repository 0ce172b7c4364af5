//! XMRpos Backend Client
//!
//! Communication layer between the point-of-sale application and its
//! transaction backend.
//!
//! ## Architecture
//!
//! **Components:**
//! - `auth`: bearer-token transport with single-flight refresh on 401
//! - `transactions`: transaction creation and the live status subscription
//! - `quote`: exchange-rate provider client
//! - `rates`: tiered, persisted exchange-rate cache with stale fallback
//! - `amount`: fiat/atomic conversions and payment URIs
//! - `config`: configuration management
//!
//! **Checkout flow:**
//! 1. Rates are read from the cache (fetched only when missing or stale)
//! 2. The fiat price is converted into atomic units
//! 3. A transaction is created through the authenticated transport
//! 4. The transaction's status stream is observed until it is accepted

pub mod amount;
pub mod auth;
pub mod config;
pub mod quote;
pub mod rates;
pub mod transactions;

use std::sync::Arc;
use xmrpos_common::{Clock, CredentialStore, Credentials, Result, SystemClock};

pub use auth::AuthClient;
pub use config::Config;
pub use quote::{HttpQuoteProvider, QuoteProvider};
pub use rates::{ExchangeRateCache, RateSnapshot, RateSource};
pub use transactions::{StatusReceiver, SubscriptionHandle, TransactionClient};

/// Owned set of backend services handed to the checkout flow.
#[derive(Clone)]
pub struct PosBackend {
    pub credentials: Credentials,
    pub auth: Arc<AuthClient>,
    pub transactions: TransactionClient,
    pub rates: Arc<ExchangeRateCache>,
}

impl PosBackend {
    /// Wire the services over `store` with the HTTP quote provider.
    pub fn new(store: Arc<dyn CredentialStore>, config: &Config) -> Result<Self> {
        let provider = HttpQuoteProvider::new(
            config.quote_provider_url.clone(),
            config.request_timeout(),
        )?;
        Self::with_provider(store, Arc::new(provider), Arc::new(SystemClock), config)
    }

    pub fn with_provider(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn QuoteProvider>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Result<Self> {
        let credentials = Credentials::new(store);
        let auth = Arc::new(AuthClient::new(credentials.clone(), config.request_timeout())?);
        let transactions = TransactionClient::new(Arc::clone(&auth));
        let rates = Arc::new(ExchangeRateCache::new(
            provider,
            credentials.clone(),
            clock,
            config.quote_base_asset.clone(),
        ));

        Ok(Self {
            credentials,
            auth,
            transactions,
            rates,
        })
    }
}
