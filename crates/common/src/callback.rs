//! Payment-completion notifications pushed by the payment processor.

use serde::{Deserialize, Serialize};

/// JSON document carried in the callback body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub amount: CallbackAmount,

    #[serde(default)]
    pub complete: bool,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub transactions: Vec<CallbackTransfer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackAmount {
    pub expected: i64,
    pub covered: CoveredAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveredAmount {
    pub total: i64,

    #[serde(default)]
    pub unlocked: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackTransfer {
    pub amount: i64,

    #[serde(default)]
    pub confirmations: i64,

    #[serde(default)]
    pub double_spend_seen: bool,

    #[serde(default)]
    pub fee: i64,

    #[serde(default)]
    pub height: i64,

    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub tx_hash: String,

    #[serde(default)]
    pub unlock_time: i64,

    #[serde(default)]
    pub locked: bool,
}

/// A parsed notification together with the companion query values.
///
/// Built once per inbound request and handed to the registered handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub amount_expected: i64,
    pub amount_covered_total: i64,
    pub complete: bool,
    pub description: Option<String>,
    pub created_at: Option<String>,
    pub transactions: Vec<CallbackTransfer>,
    pub fiat_value: f64,
    pub correlation_id: String,
}

impl CallbackEvent {
    /// Parse the JSON payload and attach the query values.
    pub fn parse(payload: &str, fiat_value: f64, correlation_id: String) -> crate::Result<Self> {
        let callback: PaymentCallback = serde_json::from_str(payload)
            .map_err(|e| crate::Error::MalformedCallback(e.to_string()))?;
        Ok(Self::from_callback(callback, fiat_value, correlation_id))
    }

    pub fn from_callback(callback: PaymentCallback, fiat_value: f64, correlation_id: String) -> Self {
        Self {
            amount_expected: callback.amount.expected,
            amount_covered_total: callback.amount.covered.total,
            complete: callback.complete,
            description: callback.description,
            created_at: callback.created_at,
            transactions: callback.transactions,
            fiat_value,
            correlation_id,
        }
    }

    /// True once the covered amount reaches the expected amount
    pub fn is_fully_covered(&self) -> bool {
        self.amount_covered_total >= self.amount_expected
    }
}
