//! Client for the exchange-rate quote provider

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use xmrpos_common::{Error, Result};

use crate::auth::{ensure_success, network_error};

/// Source of current fiat prices for a crypto asset.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetch the price of one `base_asset` in each of `currencies`.
    async fn fetch_rates(&self, base_asset: &str, currencies: &[String])
        -> Result<HashMap<String, f64>>;
}

/// Provider speaking the `?fsym=XMR&tsyms=USD,EUR` price API.
pub struct HttpQuoteProvider {
    url: String,
    client: Client,
}

impl HttpQuoteProvider {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network_error)?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    async fn fetch_rates(
        &self,
        base_asset: &str,
        currencies: &[String],
    ) -> Result<HashMap<String, f64>> {
        let symbols = currencies.join(",");
        debug!("Fetching {} quotes for {} from {}", base_asset, symbols, self.url);

        let response = self
            .client
            .get(&self.url)
            .query(&[("fsym", base_asset), ("tsyms", symbols.as_str())])
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status().as_u16();
        let body: Value = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(network_error)?;

        parse_quotes(status, &body, currencies)
    }
}

/// Extract the requested currencies from a provider response
fn parse_quotes(status: u16, body: &Value, currencies: &[String]) -> Result<HashMap<String, f64>> {
    let object = body.as_object().ok_or_else(|| Error::Remote {
        status,
        body: format!("unexpected quote response: {}", body),
    })?;

    if object.get("Response").and_then(Value::as_str) == Some("Error") {
        let message = object
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("quote provider error");
        return Err(Error::Remote {
            status,
            body: message.to_string(),
        });
    }

    let rates: HashMap<String, f64> = currencies
        .iter()
        .filter_map(|code| {
            object
                .get(code)
                .and_then(Value::as_f64)
                .map(|rate| (code.clone(), rate))
        })
        .collect();

    if rates.is_empty() {
        return Err(Error::Remote {
            status,
            body: format!("no quotes for {}", currencies.join(",")),
        });
    }

    Ok(rates)
}
