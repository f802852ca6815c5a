use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::{HashMap, HashSet},
    env,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use crate::ratelimit::{AdaptivePolicy, GeoPolicy, Tier, TierLimitTable, TierLimits};

/// Backends the storefront gateway fronts: name, URL variable, default port.
pub const BACKENDS: [(&str, &str, u16); 7] = [
    ("auth", "AUTH_SERVICE_URL", 8001),
    ("profile", "PROFILE_SERVICE_URL", 8002),
    ("product", "PRODUCT_SERVICE_URL", 8003),
    ("cart", "CART_SERVICE_URL", 8004),
    ("order", "ORDER_SERVICE_URL", 8005),
    ("payment", "PAYMENT_SERVICE_URL", 8006),
    ("notification", "NOTIFICATION_SERVICE_URL", 8007),
];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub backends: Vec<BackendConfig>,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub auth: AuthConfig,
    pub validation: ValidationConfig,
    pub request_timeout: Duration,
    pub shutdown_drain: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub critical: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub tiers: TierLimitTable,
    pub idle_ttl: Duration,
    pub geo_header: Option<String>,
    pub geo: Option<GeoPolicy>,
    pub adaptive: Option<AdaptivePolicy>,
    pub api_keys: HashMap<String, Tier>,
    pub internal_ips: HashSet<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: f64,
    pub min_calls: usize,
    pub window_size: usize,
    pub open_seconds: u64,
    pub half_open_max_requests: u32,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub trips_breaker: bool,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub verify_path: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_body_bytes: usize,
    pub max_headers: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let host = vars.string("SERVER_HOST", "0.0.0.0");
        let port: u16 = vars.parse("SERVER_PORT", 8000)?;
        let bind_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid SERVER_HOST/SERVER_PORT: {host}:{port}"))?;

        let backend_timeout = Duration::from_secs(vars.parse("BACKEND_TIMEOUT_SECONDS", 10u64)?);
        let critical = vars
            .optional("CRITICAL_SERVICES")
            .map(|raw| csv(&raw).into_iter().collect::<HashSet<_>>());
        let backends = parse_backends(&vars, backend_timeout, critical.as_ref())?;

        let rate_limit = parse_rate_limit(&vars)?;

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: vars.parse("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 0.6f64)?,
            min_calls: vars.parse("CIRCUIT_BREAKER_MIN_CALLS", 10usize)?,
            window_size: vars.parse("CIRCUIT_BREAKER_WINDOW", 20usize)?,
            open_seconds: vars.parse("CIRCUIT_BREAKER_OPEN_SECONDS", 30u64)?,
            half_open_max_requests: vars.parse("CIRCUIT_BREAKER_HALF_OPEN_MAX", 1u32)?,
        };
        if !(circuit_breaker.failure_threshold > 0.0 && circuit_breaker.failure_threshold <= 1.0) {
            bail!("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be in (0, 1]");
        }
        if circuit_breaker.min_calls == 0 || circuit_breaker.half_open_max_requests == 0 {
            bail!("circuit breaker minimum calls and half-open trials must be > 0");
        }
        if circuit_breaker.window_size < circuit_breaker.min_calls {
            bail!("CIRCUIT_BREAKER_WINDOW must be >= CIRCUIT_BREAKER_MIN_CALLS");
        }

        let health = HealthConfig {
            interval: Duration::from_secs(vars.parse("HEALTH_CHECK_INTERVAL_SECONDS", 30u64)?.max(1)),
            timeout: Duration::from_secs(vars.parse("HEALTH_CHECK_TIMEOUT_SECONDS", 5u64)?.max(1)),
            unhealthy_threshold: vars.parse("HEALTH_UNHEALTHY_THRESHOLD", 3u32)?.max(1),
            trips_breaker: vars.parse("HEALTH_TRIPS_BREAKER", true)?,
        };

        let auth = AuthConfig {
            jwt_secret: vars.optional("JWT_SECRET"),
            verify_path: vars.string("AUTH_VERIFY_PATH", "/api/auth/verify"),
            timeout: Duration::from_millis(vars.parse("AUTH_TIMEOUT_MS", 5_000u64)?.max(100)),
        };

        let validation = ValidationConfig {
            max_body_bytes: vars.parse("MAX_BODY_BYTES", 10 * 1024 * 1024usize)?,
            max_headers: vars.parse("MAX_HEADERS", 128usize)?,
        };

        let request_timeout = Duration::from_secs(vars.parse("REQUEST_TIMEOUT_SECONDS", 30u64)?);
        if request_timeout.is_zero() || backend_timeout.is_zero() {
            bail!("request and backend timeouts must be > 0");
        }

        let logging = LoggingConfig {
            level: vars.string("LOGGING_LEVEL", "info"),
            json: vars.string("LOG_FORMAT", "json").eq_ignore_ascii_case("json"),
        };

        Ok(Self {
            bind_addr,
            backends,
            rate_limit,
            circuit_breaker,
            health,
            auth,
            validation,
            request_timeout,
            shutdown_drain: Duration::from_secs(vars.parse("SHUTDOWN_DRAIN_SECONDS", 30u64)?),
            logging,
        })
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
            None => Ok(default),
        }
    }
}

fn parse_backends<F>(
    vars: &Vars<'_, F>,
    timeout: Duration,
    critical: Option<&HashSet<String>>,
) -> Result<Vec<BackendConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = Vec::with_capacity(BACKENDS.len());
    for (name, var, port) in BACKENDS {
        let raw = match (vars.0)(var) {
            Some(value) if value.trim().is_empty() => bail!("{var} is set but empty"),
            Some(value) => value.trim().to_string(),
            None => format!("http://127.0.0.1:{port}"),
        };
        let url = reqwest::Url::parse(&raw).with_context(|| format!("invalid {var}: {raw}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("{var} must be an http(s) URL");
        }

        out.push(BackendConfig {
            name: name.to_string(),
            base_url: raw.trim_end_matches('/').to_string(),
            timeout,
            critical: critical.is_none_or(|set| set.contains(name)),
        });
    }

    if let Some(critical) = critical {
        for name in critical {
            if !out.iter().any(|b| &b.name == name) {
                bail!("CRITICAL_SERVICES names unknown backend: {name}");
            }
        }
    }
    Ok(out)
}

fn parse_rate_limit<F>(vars: &Vars<'_, F>) -> Result<RateLimitConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let public = TierLimits::new(
        vars.parse("RATE_LIMIT_REQUESTS", 60u64)?,
        Duration::from_secs(vars.parse("RATE_LIMIT_WINDOW", 60u64)?),
        vars.parse("RATE_LIMIT_BURST", 100u64)?,
    );

    let minute = Duration::from_secs(60);
    let mut tiers = HashMap::from([(Tier::Public, public)]);
    for (tier, var, default) in [
        (Tier::Authenticated, "RATE_LIMIT_TIER_AUTHENTICATED", TierLimits::new(300, minute, 500)),
        (Tier::Premium, "RATE_LIMIT_TIER_PREMIUM", TierLimits::new(1000, minute, 2000)),
        (Tier::Admin, "RATE_LIMIT_TIER_ADMIN", TierLimits::new(5000, minute, 10000)),
    ] {
        let limits = match vars.optional(var) {
            Some(raw) => parse_tier_triple(&raw).with_context(|| format!("invalid {var}"))?,
            None => default,
        };
        tiers.insert(tier, limits);
    }
    let tiers = TierLimitTable::new(tiers).context("invalid tier limits")?;

    let geo_header = vars.optional("RATE_LIMIT_GEO_HEADER").map(|h| h.to_ascii_lowercase());
    let geo = match vars.optional("RATE_LIMIT_GEO_MULTIPLIERS") {
        Some(raw) => Some(GeoPolicy::new(parse_multipliers(&raw)?)?),
        None => None,
    };
    if geo.is_some() && geo_header.is_none() {
        bail!("RATE_LIMIT_GEO_MULTIPLIERS requires RATE_LIMIT_GEO_HEADER");
    }

    let threshold: u64 = vars.parse("RATE_LIMIT_ADAPTIVE_THRESHOLD", 0)?;
    let min_factor: f64 = vars.parse("RATE_LIMIT_ADAPTIVE_MIN_FACTOR", 0.25)?;
    if !(min_factor > 0.0 && min_factor <= 1.0) {
        bail!("RATE_LIMIT_ADAPTIVE_MIN_FACTOR must be in (0, 1]");
    }
    let adaptive = (threshold > 0).then_some(AdaptivePolicy {
        threshold,
        min_factor,
    });

    let mut api_keys = HashMap::new();
    for entry in vars.optional("API_KEYS").map(|r| csv(&r)).unwrap_or_default() {
        let (key, tier) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid API_KEYS entry, expected key:tier"))?;
        let tier = tier.parse::<Tier>().map_err(|e| anyhow!("invalid API_KEYS entry: {e}"))?;
        api_keys.insert(key.trim().to_string(), tier);
    }

    let internal_ips = vars
        .optional("INTERNAL_IPS")
        .map(|r| csv(&r))
        .unwrap_or_default()
        .into_iter()
        .map(|ip| ip.parse::<IpAddr>().with_context(|| format!("invalid INTERNAL_IPS entry: {ip}")))
        .collect::<Result<HashSet<_>>>()?;

    Ok(RateLimitConfig {
        tiers,
        idle_ttl: Duration::from_secs(vars.parse("RATE_LIMIT_IDLE_TTL_SECONDS", 600u64)?.max(1)),
        geo_header,
        geo,
        adaptive,
        api_keys,
        internal_ips,
    })
}

/// `requests/window_seconds/burst`, e.g. `300/60/500`.
fn parse_tier_triple(raw: &str) -> Result<TierLimits> {
    let parts = raw.split('/').map(str::trim).collect::<Vec<_>>();
    let [requests, window, burst] = parts.as_slice() else {
        bail!("expected requests/window_seconds/burst, got {raw}");
    };
    Ok(TierLimits::new(
        requests.parse().context("requests")?,
        Duration::from_secs(window.parse().context("window")?),
        burst.parse().context("burst")?,
    ))
}

fn parse_multipliers(raw: &str) -> Result<HashMap<String, f64>> {
    csv(raw)
        .into_iter()
        .map(|entry| {
            let (region, factor) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid geo multiplier entry: {entry}"))?;
            let factor = factor
                .trim()
                .parse::<f64>()
                .with_context(|| format!("invalid geo multiplier for {region}"))?;
            Ok((region.trim().to_string(), factor))
        })
        .collect()
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
