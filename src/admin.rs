use axum::{
    Json,
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{
    sync::Arc,
    time::Instant,
};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitSnapshot},
    health::{HealthMonitor, HealthStatus},
    metrics::GatewayMetrics,
    ratelimit::RateLimiter,
    router::{InternalEndpoint, RouteRule, RouteTable},
    upstream::{BackendPool, BackendSnapshot},
};

#[derive(Serialize)]
struct ServiceView {
    name: String,
    url: String,
    critical: bool,
    health: HealthStatus,
    consecutive_health_failures: u32,
    circuit: CircuitSnapshot,
    traffic: BackendSnapshot,
}

#[derive(Serialize)]
struct RoutesView<'a> {
    routes: &'a [RouteRule],
}

/// Serves the `/gateway/*` endpoints from live gateway state.
pub struct Introspection {
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) backends: Arc<BackendPool>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) metrics: Arc<GatewayMetrics>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) started_at: Instant,
}

impl Introspection {
    pub async fn respond(&self, endpoint: InternalEndpoint) -> Response<Body> {
        match endpoint {
            InternalEndpoint::Health => Json(serde_json::json!({
                "status": "ok",
                "uptime_seconds": self.started_at.elapsed().as_secs(),
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }))
            .into_response(),
            InternalEndpoint::Ready => {
                let readiness = self.health.readiness().await;
                let status = if readiness.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                (status, Json(readiness)).into_response()
            }
            InternalEndpoint::Services => Json(self.services().await).into_response(),
            InternalEndpoint::Routes => Json(RoutesView {
                routes: self.routes.rules(),
            })
            .into_response(),
            InternalEndpoint::Metrics => {
                let body = self
                    .metrics
                    .render_prometheus(self.breaker.open_count().await, self.limiter.bucket_count());
                let mut response = body.into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
        }
    }

    async fn services(&self) -> Vec<ServiceView> {
        let mut out = Vec::new();
        for health in self.health.snapshot().await {
            out.push(ServiceView {
                circuit: self.breaker.snapshot(&health.service_name).await,
                traffic: self.backends.snapshot(&health.service_name),
                name: health.service_name,
                url: health.url,
                critical: health.critical,
                health: health.status,
                consecutive_health_failures: health.consecutive_failures,
            });
        }
        out
    }
}
