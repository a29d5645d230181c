//! Tiered admission control.
//!
//! Each `(user_id, ip)` pair owns a token bucket sized by its tier:
//!
//! - `capacity = burst_allowance`
//! - `refill_rate = max_requests / window_seconds` tokens per second
//!
//! Every call refills the bucket by `elapsed × refill_rate` (capped at
//! capacity) and then tries to take one token. Continuous refill acts as a
//! sliding window, so there is no window edge to game. Over any window of
//! `W` seconds a key is admitted at most `burst_allowance + ceil(W × refill_rate)`
//! times.
//!
//! # Concurrency
//!
//! The bucket map sits behind an `RwLock`; each bucket has its own `Mutex`,
//! so refill-and-deduct is atomic per key while different keys proceed in
//! parallel. Idle buckets are evicted by [`RateLimiter::evict_idle`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersonaError;

// ============ Clock ============

/// Source of monotonic time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.origin + offset
    }
}

// ============ Tiers ============

/// Caller quota class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Premium,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
        })
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Tier::Anonymous),
            "authenticated" => Ok(Tier::Authenticated),
            "premium" => Ok(Tier::Premium),
            other => Err(format!(
                "unknown tier '{other}': expected anonymous, authenticated, or premium"
            )),
        }
    }
}

/// Quota configuration for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub window_seconds: u64,
    pub max_requests: u32,
    pub burst_allowance: u32,
}

impl TierLimits {
    pub fn capacity(&self) -> f64 {
        self.burst_allowance as f64
    }

    /// Tokens per second.
    pub fn refill_rate(&self) -> f64 {
        if self.window_seconds == 0 {
            return 0.0;
        }
        self.max_requests as f64 / self.window_seconds as f64
    }

    /// Upper bound on admissions within any `window` for one key.
    pub fn admission_bound(&self, window: Duration) -> u64 {
        self.burst_allowance as u64 + (window.as_secs_f64() * self.refill_rate()).ceil() as u64
    }
}

/// Default tier table: anonymous 300s/20/5, authenticated 300s/50/10,
/// premium 300s/100/20.
pub fn default_tiers() -> HashMap<Tier, TierLimits> {
    HashMap::from([
        (
            Tier::Anonymous,
            TierLimits {
                window_seconds: 300,
                max_requests: 20,
                burst_allowance: 5,
            },
        ),
        (
            Tier::Authenticated,
            TierLimits {
                window_seconds: 300,
                max_requests: 50,
                burst_allowance: 10,
            },
        ),
        (
            Tier::Premium,
            TierLimits {
                window_seconds: 300,
                max_requests: 100,
                burst_allowance: 20,
            },
        ),
    ])
}

// ============ Buckets ============

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    user_id: String,
    ip: String,
}

/// Token bucket for one `(user_id, ip)` pair.
#[derive(Debug)]
struct RateLimitBucket {
    tier: Tier,
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    window: Duration,
    last_refill: Instant,
}

impl RateLimitBucket {
    fn new(tier: Tier, limits: &TierLimits, now: Instant) -> Self {
        Self {
            tier,
            capacity: limits.capacity(),
            tokens: limits.capacity(),
            refill_rate: limits.refill_rate(),
            window: Duration::from_secs(limits.window_seconds),
            last_refill: now,
        }
    }

    /// Re-size for a different tier, keeping `0 ≤ tokens ≤ capacity`.
    fn retier(&mut self, tier: Tier, limits: &TierLimits) {
        self.tier = tier;
        self.capacity = limits.capacity();
        self.refill_rate = limits.refill_rate();
        self.window = Duration::from_secs(limits.window_seconds);
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take one token. On refusal, returns the wait until a
    /// token will be available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_rate <= 0.0 {
            return Err(self.window);
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
    }
}

// ============ Limiter ============

/// Shared admission gate. Owned by the orchestrator, never global.
pub struct RateLimiter {
    tiers: HashMap<Tier, TierLimits>,
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<RateLimitBucket>>>>,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(tiers: HashMap<Tier, TierLimits>, idle_timeout: Duration) -> Self {
        Self::with_clock(tiers, idle_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        tiers: HashMap<Tier, TierLimits>,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            buckets: RwLock::new(HashMap::new()),
            idle_timeout,
            clock,
        }
    }

    /// Limits for `tier`; an unconfigured tier falls back to anonymous.
    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        self.tiers
            .get(&tier)
            .or_else(|| self.tiers.get(&Tier::Anonymous))
            .copied()
            .unwrap_or_else(|| default_tiers()[&Tier::Anonymous])
    }

    /// Admit or refuse one request.
    pub fn allow(&self, user_id: &str, ip: &str, tier: Tier) -> bool {
        self.check(user_id, ip, tier).is_ok()
    }

    /// Like [`allow`](Self::allow), but a refusal carries a retry-after hint.
    pub fn check(&self, user_id: &str, ip: &str, tier: Tier) -> Result<(), PersonaError> {
        let now = self.clock.now();
        let bucket = self.bucket(user_id, ip, tier, now);

        let mut guard = match bucket.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!(user = user_id, ip, "rate limit bucket lock poisoned; recovering");
                poisoned.into_inner()
            }
        };
        if guard.tier != tier {
            guard.retier(tier, &self.limits_for(tier));
        }
        match guard.try_take(now) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                debug!(user = user_id, ip, %tier, ?retry_after, "rate limited");
                Err(PersonaError::RateLimited { retry_after })
            }
        }
    }

    fn bucket(&self, user_id: &str, ip: &str, tier: Tier, now: Instant) -> Arc<Mutex<RateLimitBucket>> {
        let key = BucketKey {
            user_id: user_id.to_string(),
            ip: ip.to_string(),
        };
        if let Ok(map) = self.buckets.read() {
            if let Some(b) = map.get(&key) {
                return b.clone();
            }
        }
        let limits = self.limits_for(tier);
        let mut map = match self.buckets.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(RateLimitBucket::new(tier, &limits, now))))
            .clone()
    }

    /// Drop buckets untouched for longer than the idle timeout.
    ///
    /// A bucket is only removed while no request holds a handle to it, so
    /// an in-flight deduction can never land on a detached bucket.
    /// Returns the number of buckets evicted.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut map = match self.buckets.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = map.len();
        map.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            match bucket.lock() {
                Ok(b) => now.saturating_duration_since(b.last_refill) < self.idle_timeout,
                Err(_) => false,
            }
        });
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, remaining = map.len(), "evicted idle rate limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|m| m.len()).unwrap_or(0)
    }
}
