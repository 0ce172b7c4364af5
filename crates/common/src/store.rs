//! Credential Store contract and implementations
//!
//! Data model (all values are strings):
//! - backend_access_token → bearer access token
//! - backend_refresh_token → refresh token
//! - backend_instance_url → base URL of the transaction backend
//! - exchange_rates:cache → JSON object, currency code → rate
//! - exchange_rates:primary_last_updated → epoch millis of the last primary-tier refresh
//! - exchange_rates:last_updated → epoch millis of the last reference/full refresh

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::models::TokenPair;
use crate::{Error, Result};

pub const ACCESS_TOKEN_KEY: &str = "backend_access_token";
pub const REFRESH_TOKEN_KEY: &str = "backend_refresh_token";
pub const BACKEND_URL_KEY: &str = "backend_instance_url";
pub const RATE_CACHE_KEY: &str = "exchange_rates:cache";
pub const PRIMARY_RATES_UPDATED_KEY: &str = "exchange_rates:primary_last_updated";
pub const RATES_UPDATED_KEY: &str = "exchange_rates:last_updated";

/// Async key/value persistence provided by the host application.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store, nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// The whole map is kept in memory and rewritten on every mutation through a
/// temporary file followed by a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store, creating an empty one if the file does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Credential file {} not found, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    async fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} credential entries", values.len());
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }
}

/// Granularity levels of the exchange-rate cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateTier {
    /// The single currency prices are entered in
    Primary,
    /// Currencies shown alongside the primary one
    Reference,
    /// Primary plus references
    Full,
}

impl RateTier {
    /// Store key holding this tier's last refresh time.
    ///
    /// Reference and full tiers share one timestamp.
    pub fn last_updated_key(self) -> &'static str {
        match self {
            RateTier::Primary => PRIMARY_RATES_UPDATED_KEY,
            RateTier::Reference | RateTier::Full => RATES_UPDATED_KEY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateTier::Primary => "primary",
            RateTier::Reference => "reference",
            RateTier::Full => "full",
        }
    }
}

impl std::str::FromStr for RateTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(RateTier::Primary),
            "reference" => Ok(RateTier::Reference),
            "full" | "all" => Ok(RateTier::Full),
            other => Err(Error::Configuration(format!("Unknown rate tier: {}", other))),
        }
    }
}

/// Typed view over a [`CredentialStore`].
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn access_token(&self) -> Result<Option<String>> {
        self.non_blank(ACCESS_TOKEN_KEY).await
    }

    pub async fn refresh_token(&self) -> Result<Option<String>> {
        self.non_blank(REFRESH_TOKEN_KEY).await
    }

    pub async fn backend_url(&self) -> Result<Option<String>> {
        Ok(self
            .non_blank(BACKEND_URL_KEY)
            .await?
            .map(|url| url.trim_end_matches('/').to_string()))
    }

    pub async fn set_backend_url(&self, url: &str) -> Result<()> {
        self.store.set(BACKEND_URL_KEY, url).await
    }

    pub async fn save_tokens(&self, tokens: &TokenPair) -> Result<()> {
        self.store
            .set(ACCESS_TOKEN_KEY, &tokens.access_token)
            .await?;
        self.store
            .set(REFRESH_TOKEN_KEY, &tokens.refresh_token)
            .await
    }

    /// Drop both tokens so the next request requires a fresh login.
    /// The backend URL is kept.
    pub async fn clear_session(&self) -> Result<()> {
        self.store.remove(ACCESS_TOKEN_KEY).await?;
        self.store.remove(REFRESH_TOKEN_KEY).await?;
        info!("Cleared stored session tokens");
        Ok(())
    }

    /// Persisted rate map. A corrupt entry reads as empty.
    pub async fn cached_rates(&self) -> Result<HashMap<String, f64>> {
        let Some(raw) = self.store.get(RATE_CACHE_KEY).await? else {
            return Ok(HashMap::new());
        };

        match serde_json::from_str(&raw) {
            Ok(rates) => Ok(rates),
            Err(e) => {
                warn!("Ignoring unreadable exchange rate cache: {}", e);
                Ok(HashMap::new())
            }
        }
    }

    pub async fn save_cached_rates(&self, rates: &HashMap<String, f64>) -> Result<()> {
        let raw = serde_json::to_string(rates)?;
        self.store.set(RATE_CACHE_KEY, &raw).await
    }

    pub async fn rates_last_updated(&self, tier: RateTier) -> Result<Option<DateTime<Utc>>> {
        let raw = self.store.get(tier.last_updated_key()).await?;
        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|millis| *millis > 0)
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    /// Record a refresh time for `tier`, never moving it backwards.
    pub async fn save_rates_last_updated(&self, tier: RateTier, at: DateTime<Utc>) -> Result<()> {
        if let Some(previous) = self.rates_last_updated(tier).await? {
            if previous >= at {
                debug!("Keeping newer {} tier timestamp {}", tier.as_str(), previous);
                return Ok(());
            }
        }
        self.store
            .set(tier.last_updated_key(), &at.timestamp_millis().to_string())
            .await
    }

    async fn non_blank(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(key)
            .await?
            .filter(|value| !value.trim().is_empty()))
    }
}
