//! Configuration management for the backend client
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::amount::parse_confirmations;

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// File backing the credential store
    pub credentials_path: PathBuf,

    /// Quote provider endpoint
    pub quote_provider_url: String,

    /// Asset the quotes are expressed against
    pub quote_base_asset: String,

    /// Currency prices are entered in
    pub primary_fiat_currency: String,

    /// Currencies displayed next to the primary one
    pub reference_fiat_currencies: Vec<String>,

    /// Outbound HTTP timeout in seconds
    pub request_timeout_secs: u64,

    /// Confirmations the backend waits for before accepting a payment
    pub required_confirmations: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        let config = Config {
            credentials_path: env::var("CREDENTIALS_PATH")
                .unwrap_or_else(|_| "./xmrpos-credentials.json".to_string())
                .into(),

            quote_provider_url: env::var("QUOTE_PROVIDER_URL")
                .unwrap_or_else(|_| "https://min-api.cryptocompare.com/data/price".to_string()),

            quote_base_asset: env::var("QUOTE_BASE_ASSET").unwrap_or_else(|_| "XMR".to_string()),

            primary_fiat_currency: env::var("PRIMARY_FIAT_CURRENCY")
                .unwrap_or_else(|_| "USD".to_string())
                .trim()
                .to_uppercase(),

            reference_fiat_currencies: parse_currency_list(
                &env::var("REFERENCE_FIAT_CURRENCIES").unwrap_or_default(),
            ),

            request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid REQUEST_TIMEOUT_SECS")?,

            required_confirmations: parse_confirmations(
                &env::var("REQUIRED_CONFIRMATIONS").unwrap_or_else(|_| "0-conf".to_string()),
            )
            .context("Invalid REQUIRED_CONFIRMATIONS")?,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than 0");
        }

        if self.quote_base_asset.trim().is_empty() {
            anyhow::bail!("QUOTE_BASE_ASSET must not be empty");
        }

        if !self.quote_provider_url.starts_with("http://")
            && !self.quote_provider_url.starts_with("https://")
        {
            anyhow::bail!("QUOTE_PROVIDER_URL must be an http(s) URL");
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Primary followed by the references, without duplicates
    pub fn all_fiat_currencies(&self) -> Vec<String> {
        let mut all = Vec::new();
        if !self.primary_fiat_currency.is_empty() {
            all.push(self.primary_fiat_currency.clone());
        }
        for currency in &self.reference_fiat_currencies {
            if !all.contains(currency) {
                all.push(currency.clone());
            }
        }
        all
    }
}

/// Split a comma-separated list of currency codes
pub fn parse_currency_list(raw: &str) -> Vec<String> {
    let mut currencies: Vec<String> = Vec::new();
    for code in raw.split(',').map(|c| c.trim().to_uppercase()) {
        if !code.is_empty() && !currencies.contains(&code) {
            currencies.push(code);
        }
    }
    currencies
}
