use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authenticated, login required")]
    Unauthenticated,

    #[error("Backend rejected request with status {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Malformed callback: {0}")]
    MalformedCallback(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transport failures are the only kind a caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Error::Unauthenticated)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
