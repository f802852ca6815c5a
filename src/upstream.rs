use axum::{
    body::Body,
    response::Response,
};
use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    config::BackendConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Proxies requests to the configured backends over one pooled client.
pub struct BackendPool {
    client: reqwest::Client,
    backends: HashMap<String, BackendConfig>,
    stats: DashMap<String, Arc<BackendStats>>,
}

#[derive(Default)]
struct BackendStats {
    in_flight: AtomicU64,
    consecutive_failures: AtomicU64,
    success_total: AtomicU64,
    failure_total: AtomicU64,
    avg_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendSnapshot {
    pub in_flight: u64,
    pub consecutive_failures: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub avg_latency_ms: u64,
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl BackendPool {
    pub fn new(backends: &[BackendConfig]) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self::with_client(client, backends))
    }

    pub fn with_client(client: reqwest::Client, backends: &[BackendConfig]) -> Self {
        let stats = DashMap::new();
        let mut by_name = HashMap::new();
        for backend in backends {
            stats.insert(backend.name.clone(), Arc::new(BackendStats::default()));
            by_name.insert(backend.name.clone(), backend.clone());
        }
        Self {
            client,
            backends: by_name,
            stats,
        }
    }

    /// The pooled client, shared with the auth verifier and health probes.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn snapshot(&self, name: &str) -> BackendSnapshot {
        self.stats
            .get(name)
            .map(|stats| BackendSnapshot {
                in_flight: stats.in_flight.load(Ordering::Relaxed),
                consecutive_failures: stats.consecutive_failures.load(Ordering::Relaxed),
                success_total: stats.success_total.load(Ordering::Relaxed),
                failure_total: stats.failure_total.load(Ordering::Relaxed),
                avg_latency_ms: stats.avg_latency_micros.load(Ordering::Relaxed) / 1_000,
            })
            .unwrap_or_default()
    }

    /// Single attempt, bounded by the backend's own timeout. A backend 5xx is
    /// returned as a response; transport failures come back as errors.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        backend: &str,
        target_url: &str,
    ) -> GatewayResult<Response<Body>> {
        let cfg = self
            .backends
            .get(backend)
            .ok_or_else(|| GatewayError::Internal(format!("unknown backend {backend}")))?;
        let stats = self
            .stats
            .get(backend)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| GatewayError::Internal("backend stats unavailable".to_string()))?;

        let url = match ctx.uri.query() {
            Some(query) => format!("{target_url}?{query}"),
            None => target_url.to_string(),
        };

        let mut request = self
            .client
            .request(ctx.method.clone(), &url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_request_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header(CORRELATION_HEADER, ctx.correlation_id.as_str());
        if let Some(user) = &ctx.user {
            request = request
                .header(USER_ID_HEADER, user.user_id.as_str())
                .header(USER_TIER_HEADER, user.tier.as_str());
        }
        if let Some(forwarded) = forwarded_for(ctx) {
            request = request.header("x-forwarded-for", forwarded);
        }

        let _in_flight = InFlight::enter(&stats.in_flight);
        let started = Instant::now();

        let result = async {
            let upstream = request.timeout(cfg.timeout).send().await?;
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let body = upstream.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        }
        .await;

        let (status, headers, body) = match result {
            Ok(parts) => parts,
            Err(err) => {
                stats.record_failure();
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    backend,
                    error = %err,
                    "backend call failed"
                );
                return Err(GatewayError::from(err));
            }
        };

        if status.is_server_error() {
            stats.record_failure();
        } else {
            stats.record_success(started.elapsed());
        }

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if !is_hop_by_hop(name) && name != http::header::CONTENT_LENGTH {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::BadGateway(e.to_string()))
    }
}

impl BackendStats {
    fn record_success(&self, latency: Duration) {
        self.success_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let latency_micros = latency.as_micros() as u64;
        let current = self.avg_latency_micros.load(Ordering::Relaxed);
        let updated = if current == 0 {
            latency_micros
        } else {
            (current * 7 + latency_micros) / 8
        };
        self.avg_latency_micros.store(updated, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failure_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }
}

fn forwarded_for(ctx: &RequestContext) -> Option<HeaderValue> {
    let ip = ctx.client_ip?;
    let chain = match ctx
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    {
        Some(existing) => format!("{}, {ip}", existing.trim()),
        None => ip.to_string(),
    };
    HeaderValue::from_str(&chain).ok()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Identity and tracing headers are always set by the gateway, never relayed.
fn should_forward_request_header(name: &HeaderName) -> bool {
    !is_hop_by_hop(name)
        && !matches!(
            name.as_str(),
            "host"
                | "content-length"
                | "x-forwarded-for"
                | CORRELATION_HEADER
                | USER_ID_HEADER
                | USER_TIER_HEADER
        )
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    use super::*;
    use crate::{auth::AuthenticatedUser, ratelimit::Tier};

    fn backend(url: &str, timeout: Duration) -> BackendConfig {
        BackendConfig {
            name: "cart".to_string(),
            base_url: url.to_string(),
            timeout,
            critical: true,
        }
    }

    fn ctx(uri: &str, headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            "corr-42".to_string(),
            Method::GET,
            uri.parse().unwrap(),
            headers,
            Bytes::new(),
            Some("203.0.113.9".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn injects_identity_and_strips_spoofed_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cart/items"))
            .and(query_param("page", "2"))
            .and(header("x-user-id", "u-7"))
            .and(header("x-user-tier", "premium"))
            .and(header("x-correlation-id", "corr-42"))
            .and(header("x-forwarded-for", "203.0.113.9"))
            .respond_with(ResponseTemplate::new(200).insert_header("x-cart", "1"))
            .expect(1)
            .mount(&server)
            .await;

        let pool = BackendPool::new(&[backend(&server.uri(), Duration::from_secs(2))]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("admin"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let mut ctx = ctx("/api/cart/items?page=2", headers);
        ctx.user = Some(AuthenticatedUser {
            user_id: "u-7".to_string(),
            tier: Tier::Premium,
        });

        let target = format!("{}/api/cart/items", server.uri());
        let response = pool.forward(&ctx, "cart", &target).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cart"], "1");

        let received = &server.received_requests().await.unwrap()[0];
        assert_eq!(received.headers.get_all("x-user-id").iter().count(), 1);
        assert_eq!(pool.snapshot("cart").success_total, 1);
    }

    #[tokio::test]
    async fn backend_5xx_is_relayed_and_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pool = BackendPool::new(&[backend(&server.uri(), Duration::from_secs(2))]).unwrap();
        let target = format!("{}/api/cart", server.uri());
        let response = pool.forward(&ctx("/api/cart", HeaderMap::new()), "cart", &target).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(pool.snapshot("cart").failure_total, 1);
        assert_eq!(pool.snapshot("cart").in_flight, 0);
    }

    #[tokio::test]
    async fn maps_transport_failures() {
        let pool = BackendPool::new(&[backend("http://127.0.0.1:1", Duration::from_secs(2))]).unwrap();
        let err = pool
            .forward(&ctx("/api/cart", HeaderMap::new()), "cart", "http://127.0.0.1:1/api/cart")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let pool = BackendPool::new(&[backend(&server.uri(), Duration::from_millis(50))]).unwrap();
        let target = format!("{}/api/cart", server.uri());
        let err = pool
            .forward(&ctx("/api/cart", HeaderMap::new()), "cart", &target)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(pool.snapshot("cart").consecutive_failures, 1);
    }
}
