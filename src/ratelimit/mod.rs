pub mod bucket;

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::ratelimit::bucket::TokenBucketState;

/// Header value reported for callers that are never limited.
pub const UNLIMITED: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Public,
    Authenticated,
    Premium,
    Admin,
    Internal,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
            Self::Premium => "premium",
            Self::Admin => "admin",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "authenticated" | "user" | "basic" => Ok(Self::Authenticated),
            "premium" => Ok(Self::Premium),
            "admin" => Ok(Self::Admin),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyIdentity {
    Ip(IpAddr),
    User(String),
    ApiKey(String),
}

/// Bucket identity. A caller's region only scales limits and never selects a
/// different bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub identity: KeyIdentity,
    pub tier: Tier,
}

impl RateLimitKey {
    pub fn new(identity: KeyIdentity, tier: Tier) -> Self {
        Self { identity, tier }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierLimits {
    pub requests_per_window: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub window: Duration,
    pub burst_capacity: u64,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl TierLimits {
    pub fn new(requests_per_window: u64, window: Duration, burst_capacity: u64) -> Self {
        Self {
            requests_per_window,
            window,
            burst_capacity,
        }
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.requests_per_window as f64 / self.window.as_secs_f64()
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.burst_capacity == 0 {
            bail!("tier {tier}: burst capacity must be > 0");
        }
        if self.window.is_zero() {
            bail!("tier {tier}: window must be > 0");
        }
        Ok(())
    }
}

/// Per-tier limits, fixed after startup. `Internal` never has an entry.
#[derive(Debug, Clone)]
pub struct TierLimitTable {
    limits: HashMap<Tier, TierLimits>,
}

impl TierLimitTable {
    pub fn new(limits: HashMap<Tier, TierLimits>) -> Result<Self> {
        for tier in [Tier::Public, Tier::Authenticated, Tier::Premium, Tier::Admin] {
            limits
                .get(&tier)
                .ok_or_else(|| anyhow!("missing rate limits for tier {tier}"))?
                .validate(tier)?;
        }
        if limits.contains_key(&Tier::Internal) {
            bail!("internal tier is unlimited and cannot be configured");
        }
        Ok(Self { limits })
    }

    pub fn get(&self, tier: Tier) -> Option<&TierLimits> {
        self.limits.get(&tier)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeoPolicy {
    multipliers: HashMap<String, f64>,
}

impl GeoPolicy {
    pub fn new(multipliers: HashMap<String, f64>) -> Result<Self> {
        let mut normalized = HashMap::with_capacity(multipliers.len());
        for (region, factor) in multipliers {
            if !(factor > 0.0 && factor.is_finite()) {
                bail!("geo multiplier for {region} must be a positive number");
            }
            normalized.insert(region.trim().to_ascii_uppercase(), factor);
        }
        Ok(Self {
            multipliers: normalized,
        })
    }

    pub fn factor(&self, region: Option<&str>) -> f64 {
        region
            .map(|r| r.trim().to_ascii_uppercase())
            .and_then(|r| self.multipliers.get(&r).copied())
            .unwrap_or(1.0)
    }
}

/// Shrinks limits while the gateway is carrying more in-flight requests than
/// `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    pub threshold: u64,
    pub min_factor: f64,
}

impl AdaptivePolicy {
    pub fn factor(&self, in_flight: u64) -> f64 {
        if self.threshold == 0 || in_flight <= self.threshold {
            return 1.0;
        }
        (self.threshold as f64 / in_flight as f64).max(self.min_factor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            reset_at: Utc::now(),
            retry_after_secs: 0,
        }
    }
}

pub struct RateLimiter {
    tiers: TierLimitTable,
    buckets: DashMap<RateLimitKey, Arc<Mutex<TokenBucketState>>>,
    geo: Option<GeoPolicy>,
    adaptive: Option<AdaptivePolicy>,
    load: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(tiers: TierLimitTable) -> Self {
        Self {
            tiers,
            buckets: DashMap::new(),
            geo: None,
            adaptive: None,
            load: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_geo(mut self, geo: GeoPolicy) -> Self {
        self.geo = Some(geo);
        self
    }

    /// `load` is the gateway's in-flight request gauge.
    pub fn with_adaptive(mut self, adaptive: AdaptivePolicy, load: Arc<AtomicU64>) -> Self {
        self.adaptive = Some(adaptive);
        self.load = load;
        self
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// `region` feeds the geographic multiplier only.
    pub async fn allow(&self, key: &RateLimitKey, region: Option<&str>) -> RateLimitDecision {
        self.allow_at(key, region, Instant::now()).await
    }

    pub async fn allow_at(
        &self,
        key: &RateLimitKey,
        region: Option<&str>,
        now: Instant,
    ) -> RateLimitDecision {
        let Some((limits, capacity, refill)) = self.effective_limits(key.tier, region) else {
            return RateLimitDecision::unlimited();
        };

        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucketState::new(capacity, refill, now))))
            .clone();
        let mut bucket = bucket.lock().await;
        bucket.rescale(capacity, refill);

        let allowed = bucket.try_consume(now);
        decision_from(&bucket, &limits, allowed)
    }

    /// Current quota for `key` without consuming a token or creating a bucket.
    pub async fn peek(&self, key: &RateLimitKey, region: Option<&str>) -> RateLimitDecision {
        let Some((limits, capacity, refill)) = self.effective_limits(key.tier, region) else {
            return RateLimitDecision::unlimited();
        };

        let existing = self.buckets.get(key).map(|b| Arc::clone(b.value()));
        let now = Instant::now();
        let snapshot = match existing {
            Some(bucket) => {
                let bucket = bucket.lock().await;
                let mut projected = bucket.clone();
                projected.rescale(capacity, refill);
                projected.refill(now);
                projected
            }
            None => TokenBucketState::new(capacity, refill, now),
        };

        let allowed = snapshot.tokens() >= 1.0;
        decision_from(&snapshot, &limits, allowed)
    }

    /// Drops buckets untouched for longer than `ttl`. A fresh bucket starts full,
    /// so eviction never changes what a caller is allowed to do.
    pub fn evict_idle(&self, ttl: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Ok(state) => now.saturating_duration_since(state.last_refill()) < ttl,
            Err(_) => true,
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn spawn_eviction(
        self: Arc<Self>,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval((ttl / 2).max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = self.evict_idle(ttl, Instant::now());
                        if evicted > 0 {
                            tracing::debug!(
                                evicted,
                                remaining = self.bucket_count(),
                                "evicted idle rate-limit buckets"
                            );
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("rate-limit eviction task stopping");
                        break;
                    }
                }
            }
        })
    }

    fn effective_limits(&self, tier: Tier, region: Option<&str>) -> Option<(TierLimits, f64, f64)> {
        let limits = *self.tiers.get(tier)?;

        let mut factor = 1.0;
        if let Some(geo) = &self.geo {
            factor *= geo.factor(region);
        }
        if let Some(adaptive) = &self.adaptive {
            factor *= adaptive.factor(self.load.load(Ordering::Relaxed));
        }

        let capacity = (limits.burst_capacity as f64 * factor).floor().max(1.0);
        let refill = limits.refill_per_sec() * factor;
        Some((limits, capacity, refill))
    }
}

fn decision_from(bucket: &TokenBucketState, limits: &TierLimits, allowed: bool) -> RateLimitDecision {
    let now = Utc::now();
    let limit = bucket.capacity() as u64;

    if allowed {
        let until_full = bucket.time_until(bucket.capacity()).unwrap_or(limits.window);
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: bucket.tokens().floor() as u64,
            reset_at: reset_after(now, until_full),
            retry_after_secs: 0,
        }
    } else {
        let wait = bucket.time_until(1.0).unwrap_or(limits.window);
        RateLimitDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: reset_after(now, wait),
            retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
        }
    }
}

fn reset_after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
