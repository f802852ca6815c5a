use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::Response,
};
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use crate::{
    config::RateLimitConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{KeyIdentity, RateLimitDecision, RateLimitKey, RateLimiter, Tier},
};

const API_KEY_HEADER: &str = "x-api-key";

/// Derives the bucket key: authenticated user, then a recognised API key, then
/// the client address.
pub struct KeyResolver {
    api_keys: HashMap<String, Tier>,
    internal_ips: HashSet<IpAddr>,
    geo_header: Option<HeaderName>,
}

impl KeyResolver {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            api_keys: cfg.api_keys.clone(),
            internal_ips: cfg.internal_ips.clone(),
            geo_header: cfg
                .geo_header
                .as_deref()
                .filter(|_| cfg.geo.is_some())
                .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok()),
        }
    }

    /// Client-supplied region. Only ever used to pick a geo multiplier.
    pub fn region<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        self.geo_header
            .as_ref()
            .and_then(|h| ctx.headers.get(h))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn resolve(&self, ctx: &RequestContext) -> RateLimitKey {
        if let Some(user) = &ctx.user {
            RateLimitKey::new(KeyIdentity::User(user.user_id.clone()), user.tier)
        } else if let Some((api_key, tier)) = self.api_key(ctx) {
            RateLimitKey::new(KeyIdentity::ApiKey(api_key.to_string()), tier)
        } else {
            let ip = ctx.client_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let tier = if self.internal_ips.contains(&ip) {
                Tier::Internal
            } else {
                Tier::Public
            };
            RateLimitKey::new(KeyIdentity::Ip(ip), tier)
        }
    }

    fn api_key(&self, ctx: &RequestContext) -> Option<(&str, Tier)> {
        let provided = ctx
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())?
            .as_bytes();
        self.api_keys
            .iter()
            .find(|(expected, _)| timing_safe_eq(expected.as_bytes(), provided))
            .map(|(key, tier)| (key.as_str(), *tier))
    }
}

pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    resolver: KeyResolver,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, resolver: KeyResolver) -> Self {
        Self { limiter, resolver }
    }

    /// Quota for requests rejected before this stage ran. Never consumes a token.
    pub async fn current(&self, ctx: &RequestContext) -> RateLimitDecision {
        let key = ctx
            .rate_limit_key
            .clone()
            .unwrap_or_else(|| self.resolver.resolve(ctx));
        self.limiter.peek(&key, self.resolver.region(ctx)).await
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let key = self.resolver.resolve(ctx);
        let decision = self.limiter.allow(&key, self.resolver.region(ctx)).await;

        ctx.tier = key.tier;
        ctx.rate_limit_key = Some(key);
        ctx.rate_limit = Some(decision.clone());

        if decision.allowed {
            Ok(ControlFlow::Continue)
        } else {
            Err(GatewayError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }
}

/// Writes `X-RateLimit-*` headers. `Retry-After` comes from the error envelope.
pub fn apply_headers(response: &mut Response<Body>, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}
