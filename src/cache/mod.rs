//! Multi-tier response cache with single-flight computation.
//!
//! # Tiers
//!
//! Lookups walk the configured tiers fastest first (typically
//! `memory → shared → durable`). A hit in a slower tier is copied into
//! every faster tier before it is returned. Every tier call runs under
//! `tier_timeout`; a tier that errors or stalls is logged as
//! [`CacheError`] and skipped, so cache trouble never fails a request.
//!
//! An entry is served only while it is fresh: its TTL has not passed and
//! no newer version of the template it was rendered with has been
//! published (per the shared [`VersionWatermarks`]). Stale entries are
//! removed from every tier and reported as a miss.
//!
//! # Single flight
//!
//! [`CacheManager::compute_once`] guarantees at most one concurrent
//! computation per key:
//!
//! 1. On a miss the first caller becomes the leader and runs the producer
//!    on a detached task. The task stores the result before publishing it,
//!    so a finished computation is cached even if every caller went away.
//! 2. Concurrent callers for the same key wait on the leader's result for
//!    up to `wait_timeout`. If the wait runs out, or the leader's producer
//!    stalled past `producer_timeout` and was aborted, they compute
//!    directly without caching.
//! 3. A producer error is delivered to every waiter and nothing is stored.

pub mod durable;
pub mod tier;

pub use durable::SqliteTier;
pub use tier::{CacheTier, MemoryTier, SharedTier};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use persona_harness_core::error::{CacheError, PersonaError};
use persona_harness_core::models::CacheEntry;
use persona_harness_core::template::VersionWatermarks;

use crate::config::CacheConfig;

/// Normalized cache key for a request.
///
/// The query is lower-cased and its whitespace collapsed, so trivially
/// different spellings of one question share an entry. Returns 64 hex
/// characters.
pub fn cache_key(query: &str, personality_id: &str, language: &str) -> String {
    let normalized = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(personality_id.trim().as_bytes());
    hasher.update([0x1f]);
    hasher.update(language.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub tier_timeout: Duration,
    pub wait_timeout: Duration,
    pub producer_timeout: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            tier_timeout: Duration::from_millis(config.tier_timeout_ms),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            producer_timeout: Duration::from_secs(config.producer_timeout_secs),
        }
    }
}

/// How [`CacheManager::compute_once`] obtained its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the named tier.
    Hit { tier: String },
    /// This caller led the computation and the result was stored.
    Computed,
    /// Another caller's computation was shared.
    Joined,
    /// Computed by this caller without caching, after the shared
    /// computation was unavailable.
    Direct,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: CacheEntry,
    pub outcome: CacheOutcome,
}

/// Why `compute_once` produced no entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("producer failed: {0}")]
    Failed(String),

    #[error("producer timed out after {0:?}")]
    TimedOut(Duration),

    #[error("producer task aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
enum Flight {
    Ready {
        entry: CacheEntry,
        from_tier: Option<String>,
    },
    Failed(ComputeError),
}

type FlightRx = watch::Receiver<Option<Flight>>;

enum Role {
    Leader(watch::Sender<Option<Flight>>, FlightRx),
    Follower(FlightRx),
}

/// Owns the cache tiers and the single-flight map.
pub struct CacheManager {
    tiers: Vec<Arc<dyn CacheTier>>,
    watermarks: VersionWatermarks,
    settings: CacheSettings,
    inflight: Mutex<HashMap<String, FlightRx>>,
}

impl CacheManager {
    /// `tiers` are consulted in order; put the fastest first.
    pub fn new(
        tiers: Vec<Arc<dyn CacheTier>>,
        watermarks: VersionWatermarks,
        settings: CacheSettings,
    ) -> Self {
        Self {
            tiers,
            watermarks,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    /// Fresh entry for `key`, if any tier has one.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lookup(key).await.map(|(entry, _)| entry)
    }

    /// Store `entry` under `key` in every tier. Returns the stored entry.
    pub async fn put(&self, key: &str, mut entry: CacheEntry, ttl: Duration) -> CacheEntry {
        entry.key = key.to_string();
        entry.ttl_secs = ttl.as_secs();
        for tier in &self.tiers {
            self.guarded(tier.as_ref(), "put", tier.put(&entry)).await;
        }
        entry
    }

    /// Remove `key` from every tier.
    pub async fn invalidate(&self, key: &str) {
        for tier in &self.tiers {
            self.guarded(tier.as_ref(), "remove", tier.remove(key)).await;
        }
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Return the cached entry for `key`, or compute it at most once
    /// across concurrent callers.
    pub async fn compute_once<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<Resolved, ComputeError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CacheEntry, PersonaError>> + Send + 'static,
    {
        if let Some((entry, tier)) = self.lookup(key).await {
            return Ok(Resolved {
                entry,
                outcome: CacheOutcome::Hit { tier },
            });
        }

        let producer = Arc::new(producer);
        match self.join_or_lead(key) {
            Role::Leader(tx, rx) => {
                debug!(key, "leading computation");
                self.spawn_flight(key.to_string(), ttl, producer, tx);
                match wait_for_flight(rx).await {
                    Some(Flight::Ready { entry, from_tier }) => Ok(Resolved {
                        entry,
                        outcome: match from_tier {
                            Some(tier) => CacheOutcome::Hit { tier },
                            None => CacheOutcome::Computed,
                        },
                    }),
                    Some(Flight::Failed(err)) => Err(err),
                    None => Err(ComputeError::Aborted),
                }
            }
            Role::Follower(rx) => {
                debug!(key, "joining in-flight computation");
                match timeout(self.settings.wait_timeout, wait_for_flight(rx)).await {
                    Ok(Some(Flight::Ready { entry, .. })) => Ok(Resolved {
                        entry,
                        outcome: CacheOutcome::Joined,
                    }),
                    Ok(Some(Flight::Failed(ComputeError::Failed(message)))) => {
                        Err(ComputeError::Failed(message))
                    }
                    Ok(_) => {
                        warn!(key, "shared computation aborted; computing directly");
                        self.compute_direct(key, producer.as_ref()).await
                    }
                    Err(_) => {
                        warn!(
                            key,
                            wait = ?self.settings.wait_timeout,
                            "shared computation still running; computing directly"
                        );
                        self.compute_direct(key, producer.as_ref()).await
                    }
                }
            }
        }
    }

    // ============ Internals ============

    async fn lookup(&self, key: &str) -> Option<(CacheEntry, String)> {
        let now = chrono::Utc::now().timestamp();
        for (i, tier) in self.tiers.iter().enumerate() {
            let Some(Some(entry)) = self.guarded(tier.as_ref(), "get", tier.get(key)).await else {
                continue;
            };

            if entry.is_expired(now) {
                debug!(key, tier = tier.name(), "cache entry expired");
                self.invalidate(key).await;
                return None;
            }
            if self.watermarks.is_superseded(
                &entry.template_id,
                &entry.personality_id,
                entry.template_version_used,
            ) {
                info!(
                    key,
                    tier = tier.name(),
                    template = %entry.template_id,
                    version = entry.template_version_used,
                    "cache entry rendered with superseded template; invalidating"
                );
                self.invalidate(key).await;
                return None;
            }

            for faster in &self.tiers[..i] {
                self.guarded(faster.as_ref(), "backfill", faster.put(&entry))
                    .await;
            }
            debug!(key, tier = tier.name(), "cache hit");
            return Some((entry, tier.name().to_string()));
        }
        None
    }

    /// Run one tier operation under the tier timeout. Failures are logged
    /// and turned into `None`.
    async fn guarded<T>(
        &self,
        tier: &dyn CacheTier,
        op: &'static str,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        let err = match timeout(self.settings.tier_timeout, fut).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err,
            Err(_) => CacheError::Timeout {
                tier: tier.name().to_string(),
            },
        };
        warn!(tier = tier.name(), op, error = %err, "cache tier unavailable; skipping");
        None
    }

    fn join_or_lead(&self, key: &str) -> Role {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(rx) = inflight.get(key) {
            // A closed channel means the leader task died without landing.
            if rx.has_changed().is_ok() {
                return Role::Follower(rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx.clone());
        Role::Leader(tx, rx)
    }

    fn land(&self, key: &str) {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight.remove(key);
    }

    fn spawn_flight<F, Fut>(
        self: &Arc<Self>,
        key: String,
        ttl: Duration,
        producer: Arc<F>,
        tx: watch::Sender<Option<Flight>>,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CacheEntry, PersonaError>> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let flight = manager.fly(&key, ttl, producer.as_ref()).await;
            manager.land(&key);
            let _ = tx.send(Some(flight));
        });
    }

    async fn fly<F, Fut>(&self, key: &str, ttl: Duration, producer: &F) -> Flight
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CacheEntry, PersonaError>>,
    {
        // Another flight may have landed between our miss and taking the lead.
        if let Some((entry, tier)) = self.lookup(key).await {
            return Flight::Ready {
                entry,
                from_tier: Some(tier),
            };
        }

        match timeout(self.settings.producer_timeout, producer()).await {
            Ok(Ok(entry)) => {
                let entry = self.put(key, entry, ttl).await;
                debug!(key, "computed entry stored");
                Flight::Ready {
                    entry,
                    from_tier: None,
                }
            }
            Ok(Err(err)) => {
                warn!(key, error = %err, "producer failed; nothing cached");
                Flight::Failed(ComputeError::Failed(err.to_string()))
            }
            Err(_) => {
                warn!(key, limit = ?self.settings.producer_timeout, "producer stalled; aborted");
                Flight::Failed(ComputeError::TimedOut(self.settings.producer_timeout))
            }
        }
    }

    async fn compute_direct<F, Fut>(&self, key: &str, producer: &F) -> Result<Resolved, ComputeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CacheEntry, PersonaError>>,
    {
        match timeout(self.settings.producer_timeout, producer()).await {
            Ok(Ok(mut entry)) => {
                entry.key = key.to_string();
                Ok(Resolved {
                    entry,
                    outcome: CacheOutcome::Direct,
                })
            }
            Ok(Err(err)) => Err(ComputeError::Failed(err.to_string())),
            Err(_) => Err(ComputeError::TimedOut(self.settings.producer_timeout)),
        }
    }
}

async fn wait_for_flight(mut rx: FlightRx) -> Option<Flight> {
    let flight = match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    flight
}
