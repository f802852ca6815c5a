use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    fmt,
    sync::Arc,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    circuit_breaker::CircuitBreaker,
    config::{BackendConfig, HealthConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub service_name: String,
    pub url: String,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub services: Vec<BackendHealth>,
}

/// Periodic `/health` probing, one task per backend. Entries are only written
/// by probe results.
pub struct HealthMonitor {
    client: reqwest::Client,
    cfg: HealthConfig,
    order: Vec<String>,
    entries: DashMap<String, Arc<Mutex<BackendHealth>>>,
    breaker: Option<CircuitBreaker>,
}

impl HealthMonitor {
    /// Backends start out `HEALTHY`; the first probe runs as soon as the loops start.
    pub fn new(
        client: reqwest::Client,
        backends: &[BackendConfig],
        cfg: HealthConfig,
        breaker: Option<CircuitBreaker>,
    ) -> Self {
        let entries = DashMap::new();
        for backend in backends {
            entries.insert(
                backend.name.clone(),
                Arc::new(Mutex::new(BackendHealth {
                    service_name: backend.name.clone(),
                    url: backend.base_url.clone(),
                    consecutive_failures: 0,
                    last_check_at: None,
                    status: HealthStatus::Healthy,
                    critical: backend.critical,
                })),
            );
        }

        Self {
            client,
            breaker: breaker.filter(|_| cfg.trips_breaker),
            cfg,
            order: backends.iter().map(|b| b.name.clone()).collect(),
            entries,
        }
    }

    fn entry(&self, service: &str) -> Option<Arc<Mutex<BackendHealth>>> {
        self.entries.get(service).map(|e| Arc::clone(e.value()))
    }

    pub async fn probe_once(&self, service: &str) -> Option<HealthStatus> {
        let entry = self.entry(service)?;
        let url = format!("{}/health", entry.lock().await.url);

        let ok = match self.client.get(&url).timeout(self.cfg.timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(backend = service, error = %err, "health probe failed");
                false
            }
        };
        self.record(service, ok).await
    }

    /// Applies one probe outcome. A single success restores `HEALTHY`.
    pub async fn record(&self, service: &str, ok: bool) -> Option<HealthStatus> {
        let entry = self.entry(service)?;
        let (previous, current, failures) = {
            let mut health = entry.lock().await;
            let previous = health.status;
            health.last_check_at = Some(Utc::now());
            if ok {
                health.consecutive_failures = 0;
                health.status = HealthStatus::Healthy;
            } else {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.status = if health.consecutive_failures >= self.cfg.unhealthy_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }
            (previous, health.status, health.consecutive_failures)
        };

        if previous != current {
            if current == HealthStatus::Healthy {
                tracing::info!(backend = service, status = %current, consecutive_failures = failures, "backend health changed");
            } else {
                tracing::warn!(backend = service, status = %current, consecutive_failures = failures, "backend health changed");
            }
            if current == HealthStatus::Unhealthy
                && let Some(breaker) = &self.breaker
            {
                breaker.trip(service, "health_probe").await;
            }
        }
        Some(current)
    }

    pub async fn snapshot(&self) -> Vec<BackendHealth> {
        let mut out = Vec::with_capacity(self.order.len());
        for name in &self.order {
            if let Some(entry) = self.entry(name) {
                out.push(entry.lock().await.clone());
            }
        }
        out
    }

    /// Ready when every critical backend is `HEALTHY`.
    pub async fn readiness(&self) -> Readiness {
        let services = self.snapshot().await;
        let ready = services
            .iter()
            .filter(|s| s.critical)
            .all(|s| s.status == HealthStatus::Healthy);
        Readiness { ready, services }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.order
            .iter()
            .cloned()
            .map(|service| {
                let monitor = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(monitor.cfg.interval);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                monitor.probe_once(&service).await;
                            }
                            _ = shutdown.cancelled() => {
                                tracing::debug!(backend = %service, "health probe loop stopped");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{
        circuit_breaker::CircuitState,
        config::CircuitBreakerConfig,
    };

    fn backend(name: &str, url: &str, critical: bool) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            base_url: url.to_string(),
            timeout: Duration::from_secs(1),
            critical,
        }
    }

    fn health_cfg() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            unhealthy_threshold: 3,
            trips_breaker: true,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0.6,
            min_calls: 10,
            window_size: 20,
            open_seconds: 30,
            half_open_max_requests: 1,
        })
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy_and_trip_breaker() {
        let breaker = breaker();
        let monitor = HealthMonitor::new(
            reqwest::Client::new(),
            &[backend("cart", "http://127.0.0.1:1", true)],
            health_cfg(),
            Some(breaker.clone()),
        );

        assert_eq!(monitor.record("cart", false).await, Some(HealthStatus::Degraded));
        assert_eq!(monitor.record("cart", false).await, Some(HealthStatus::Degraded));
        assert_eq!(breaker.snapshot("cart").await.state, CircuitState::Closed);
        assert_eq!(monitor.record("cart", false).await, Some(HealthStatus::Unhealthy));
        assert_eq!(breaker.snapshot("cart").await.state, CircuitState::Open);

        assert_eq!(monitor.record("cart", true).await, Some(HealthStatus::Healthy));
        assert_eq!(monitor.snapshot().await[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn probes_hit_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let monitor = HealthMonitor::new(
            reqwest::Client::new(),
            &[
                backend("product", &server.uri(), true),
                backend("notification", "http://127.0.0.1:1", true),
            ],
            health_cfg(),
            None,
        );

        assert_eq!(monitor.probe_once("product").await, Some(HealthStatus::Healthy));
        assert_eq!(monitor.probe_once("notification").await, Some(HealthStatus::Degraded));
        assert!(monitor.probe_once("inventory").await.is_none());
        assert!(monitor.snapshot().await[0].last_check_at.is_some());
    }

    #[tokio::test]
    async fn readiness_only_considers_critical_backends() {
        let monitor = HealthMonitor::new(
            reqwest::Client::new(),
            &[
                backend("auth", "http://127.0.0.1:1", true),
                backend("notification", "http://127.0.0.1:1", false),
            ],
            health_cfg(),
            None,
        );

        for _ in 0..3 {
            monitor.record("notification", false).await;
        }
        let readiness = monitor.readiness().await;
        assert!(readiness.ready);
        assert_eq!(readiness.services.len(), 2);
        assert_eq!(readiness.services[1].status, HealthStatus::Unhealthy);

        monitor.record("auth", false).await;
        assert!(!monitor.readiness().await.ready);
    }

    #[tokio::test]
    async fn spawned_loops_stop_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = Arc::new(HealthMonitor::new(
            reqwest::Client::new(),
            &[backend("order", &server.uri(), true)],
            HealthConfig {
                interval: Duration::from_millis(20),
                ..health_cfg()
            },
            None,
        ));
        let shutdown = CancellationToken::new();
        let handles = Arc::clone(&monitor).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(monitor.snapshot().await[0].status, HealthStatus::Unhealthy);
    }
}
