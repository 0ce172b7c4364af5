//! Wire models exchanged with the transaction backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bearer credentials issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Body of `POST /auth/refresh`
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Body of `POST /transactions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    /// Amount in atomic units (1 XMR = 10^12)
    pub amount: i64,

    /// Merchant label shown to the payer
    pub description: Option<String>,

    /// Fiat value the amount was derived from
    pub amount_in_currency: f64,

    /// Fiat currency code of `amount_in_currency`
    pub currency: String,

    pub required_confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransactionResponse {
    pub id: i64,
    pub address: String,
}

/// One status update pushed over the subscription channel.
///
/// Updates for the same id supersede each other in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub id: i64,

    pub accepted: bool,

    #[serde(default)]
    pub confirmed: bool,

    /// Amount in atomic units
    #[serde(alias = "amountAtomic")]
    pub amount: i64,

    #[serde(alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, alias = "subTransactions")]
    pub sub_transactions: Vec<SubTransaction>,
}

impl TransactionStatus {
    /// Hash of the first on-chain transfer covering this payment, if any
    pub fn first_tx_hash(&self) -> Option<&str> {
        self.sub_transactions.first().map(|s| s.tx_hash.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTransaction {
    #[serde(alias = "txHash")]
    pub tx_hash: String,

    #[serde(default)]
    pub amount: i64,

    #[serde(default)]
    pub confirmations: i64,

    #[serde(default)]
    pub height: i64,

    #[serde(default, alias = "doubleSpendSeen")]
    pub double_spend_seen: bool,
}

/// Response of `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: i64,

    #[serde(default)]
    pub services: HealthServices,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthServices {
    #[serde(default)]
    pub walletrpc: bool,

    #[serde(default)]
    pub postgresql: bool,
}
