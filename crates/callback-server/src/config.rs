//! Configuration management for the callback listener
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind
    pub callback_host: String,

    /// Port the payment processor posts to
    pub callback_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        let config = Config {
            callback_host: env::var("CALLBACK_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            callback_port: env::var("CALLBACK_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid CALLBACK_PORT")?,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.callback_port == 0 {
            anyhow::bail!("CALLBACK_PORT must be greater than 0");
        }

        Ok(())
    }

    /// Get the listener address
    pub fn callback_address(&self) -> String {
        format!("{}:{}", self.callback_host, self.callback_port)
    }
}
