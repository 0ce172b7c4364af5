//! Tiered exchange-rate cache
//!
//! All tiers share one persisted rate map, merged on every successful fetch,
//! and each tier has its own freshness window:
//! - primary (single currency): 60 s
//! - reference and full: 30 min; a full refresh also counts for the primary tier
//!
//! Refreshes of one tier are serialized so a second caller reuses the first
//! caller's result. When the provider fails, cached values are served instead
//! as long as any exist for the requested currencies.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xmrpos_common::{Clock, Credentials, RateTier, Result};

use crate::quote::QuoteProvider;

pub fn tier_ttl(tier: RateTier) -> Duration {
    match tier {
        RateTier::Primary => Duration::seconds(60),
        RateTier::Reference | RateTier::Full => Duration::minutes(30),
    }
}

/// Where a returned set of rates came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    /// Served from a fresh cache, no network call
    Cache,
    /// Fetched from the provider just now
    Remote,
    /// Provider failed, possibly stale cached values returned
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub rates: BTreeMap<String, f64>,
    pub source: RateSource,
}

impl RateSnapshot {
    fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
            source: RateSource::Cache,
        }
    }

    pub fn get(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied()
    }

    pub fn is_degraded(&self) -> bool {
        self.source == RateSource::StaleFallback
    }
}

pub struct ExchangeRateCache {
    provider: Arc<dyn QuoteProvider>,
    credentials: Credentials,
    clock: Arc<dyn Clock>,
    base_asset: String,
    primary_lock: Mutex<()>,
    reference_lock: Mutex<()>,
    full_lock: Mutex<()>,
    /// Guards read-merge-write of the shared rate map
    merge_lock: Mutex<()>,
}

impl ExchangeRateCache {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        credentials: Credentials,
        clock: Arc<dyn Clock>,
        base_asset: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            credentials,
            clock,
            base_asset: base_asset.into(),
            primary_lock: Mutex::new(()),
            reference_lock: Mutex::new(()),
            full_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
        }
    }

    /// Rate of the single currency prices are entered in
    pub async fn primary_rate(&self, currency: &str) -> Result<RateSnapshot> {
        self.rates(RateTier::Primary, &[currency.to_string()])
            .await
    }

    pub async fn reference_rates(&self, currencies: &[String]) -> Result<RateSnapshot> {
        self.rates(RateTier::Reference, currencies).await
    }

    /// Primary plus reference currencies in one fetch
    pub async fn all_rates(&self, currencies: &[String]) -> Result<RateSnapshot> {
        self.rates(RateTier::Full, currencies).await
    }

    /// Rates for `currencies` under `tier`'s freshness policy.
    ///
    /// # Returns
    /// * `Ok` with `RateSource::Cache` - every currency cached and fresh
    /// * `Ok` with `RateSource::Remote` - fetched exactly `currencies`
    /// * `Ok` with `RateSource::StaleFallback` - fetch failed, cached subset returned
    /// * `Err` - fetch failed and nothing was cached for `currencies`
    pub async fn rates(&self, tier: RateTier, currencies: &[String]) -> Result<RateSnapshot> {
        let currencies = normalize(currencies);
        if currencies.is_empty() {
            return Ok(RateSnapshot::empty());
        }

        let _refreshing = self.tier_lock(tier).lock().await;

        let now = self.clock.now();
        let cached = self.credentials.cached_rates().await?;
        let last_updated = self.credentials.rates_last_updated(tier).await?;

        let cached_subset = subset(&cached, &currencies);
        let missing: Vec<&String> = currencies
            .iter()
            .filter(|code| !cached_subset.contains_key(*code))
            .collect();
        let stale = match last_updated {
            Some(at) => (now - at).abs() > tier_ttl(tier),
            None => true,
        };

        if missing.is_empty() && !stale {
            debug!("Serving cached {} rates for {:?}", tier.as_str(), currencies);
            return Ok(RateSnapshot {
                rates: cached_subset,
                source: RateSource::Cache,
            });
        }

        info!(
            "Refreshing {} rates for {:?} (missing: {:?}, stale: {})",
            tier.as_str(),
            currencies,
            missing,
            stale
        );

        match self.provider.fetch_rates(&self.base_asset, &currencies).await {
            Ok(fetched) => {
                let merged = self.merge(tier, now, fetched, &currencies).await?;

                Ok(RateSnapshot {
                    rates: subset(&merged, &currencies),
                    source: RateSource::Remote,
                })
            }
            Err(e) if !cached_subset.is_empty() => {
                warn!(
                    "Failed to refresh {} rates, using cached values: {}",
                    tier.as_str(),
                    e
                );
                Ok(RateSnapshot {
                    rates: cached_subset,
                    source: RateSource::StaleFallback,
                })
            }
            Err(e) => {
                warn!("Failed to refresh {} rates and nothing is cached: {}", tier.as_str(), e);
                Err(e)
            }
        }
    }

    /// Merge fetched entries into the persisted map without dropping others,
    /// then stamp the refreshed tier.
    ///
    /// Timestamps are compared and written under the same lock as the map, so
    /// tiers refreshing concurrently cannot move a shared timestamp backwards.
    async fn merge(
        &self,
        tier: RateTier,
        fetched_at: DateTime<Utc>,
        fetched: HashMap<String, f64>,
        currencies: &[String],
    ) -> Result<HashMap<String, f64>> {
        let _merging = self.merge_lock.lock().await;

        // Re-read so a concurrent refresh of another tier is not overwritten
        let mut merged = self.credentials.cached_rates().await?;
        merged.extend(
            fetched
                .into_iter()
                .filter(|(code, rate)| currencies.contains(code) && rate.is_finite()),
        );
        self.credentials.save_cached_rates(&merged).await?;

        self.credentials.save_rates_last_updated(tier, fetched_at).await?;
        if tier == RateTier::Full {
            self.credentials
                .save_rates_last_updated(RateTier::Primary, fetched_at)
                .await?;
        }

        Ok(merged)
    }

    fn tier_lock(&self, tier: RateTier) -> &Mutex<()> {
        match tier {
            RateTier::Primary => &self.primary_lock,
            RateTier::Reference => &self.reference_lock,
            RateTier::Full => &self.full_lock,
        }
    }
}

/// Trim, upper-case and de-duplicate, keeping first-seen order
fn normalize(currencies: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(currencies.len());
    for code in currencies {
        let code = code.trim().to_uppercase();
        if !code.is_empty() && !normalized.contains(&code) {
            normalized.push(code);
        }
    }
    normalized
}

fn subset(rates: &HashMap<String, f64>, currencies: &[String]) -> BTreeMap<String, f64> {
    currencies
        .iter()
        .filter_map(|code| rates.get(code).map(|rate| (code.clone(), *rate)))
        .collect()
}
