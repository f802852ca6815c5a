use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use http::StatusCode;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests_total: AtomicU64,
    responses_2xx: AtomicU64,
    responses_3xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    rate_limited_total: AtomicU64,
    circuit_open_total: AtomicU64,
    backend_errors_total: AtomicU64,
    backend_timeouts_total: AtomicU64,
    in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight gauge when dropped, including on cancellation.
pub struct InFlightGuard {
    gauge: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        decrement(&self.gauge);
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared with the adaptive rate limiter as its load signal.
    pub fn in_flight_gauge(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.in_flight)
    }

    pub fn request_started(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            gauge: Arc::clone(&self.in_flight),
        }
    }

    pub fn response(&self, status: StatusCode) {
        let counter = match status.as_u16() {
            200..=299 => &self.responses_2xx,
            300..=399 => &self.responses_3xx,
            400..=499 => &self.responses_4xx,
            500..=599 => &self.responses_5xx,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_rejected(&self) {
        self.circuit_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_error(&self) {
        self.backend_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_timeout(&self) {
        self.backend_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self, open_breakers: usize, rate_limit_buckets: usize) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            concat!(
                "# TYPE gateway_requests_total counter\n",
                "gateway_requests_total {}\n",
                "# TYPE gateway_responses_total counter\n",
                "gateway_responses_total{{class=\"2xx\"}} {}\n",
                "gateway_responses_total{{class=\"3xx\"}} {}\n",
                "gateway_responses_total{{class=\"4xx\"}} {}\n",
                "gateway_responses_total{{class=\"5xx\"}} {}\n",
                "# TYPE gateway_rate_limited_total counter\n",
                "gateway_rate_limited_total {}\n",
                "# TYPE gateway_circuit_open_rejections_total counter\n",
                "gateway_circuit_open_rejections_total {}\n",
                "# TYPE gateway_backend_errors_total counter\n",
                "gateway_backend_errors_total {}\n",
                "# TYPE gateway_backend_timeouts_total counter\n",
                "gateway_backend_timeouts_total {}\n",
                "# TYPE gateway_in_flight_requests gauge\n",
                "gateway_in_flight_requests {}\n",
                "# TYPE gateway_open_circuits gauge\n",
                "gateway_open_circuits {}\n",
                "# TYPE gateway_rate_limit_buckets gauge\n",
                "gateway_rate_limit_buckets {}\n"
            ),
            load(&self.requests_total),
            load(&self.responses_2xx),
            load(&self.responses_3xx),
            load(&self.responses_4xx),
            load(&self.responses_5xx),
            load(&self.rate_limited_total),
            load(&self.circuit_open_total),
            load(&self.backend_errors_total),
            load(&self.backend_timeouts_total),
            load(&self.in_flight),
            open_breakers,
            rate_limit_buckets,
        )
    }
}

fn decrement(gauge: &AtomicU64) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
