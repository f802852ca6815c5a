use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Mutex,
    time::Instant,
};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_ratio: f64,
    pub seconds_since_change: u64,
}

/// Per-backend breakers. Each backend has its own lock; backends never contend.
#[derive(Clone)]
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    states: Arc<DashMap<String, Arc<Mutex<BreakerState>>>>,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    window: VecDeque<bool>,
    half_open_in_flight: u32,
    last_state_change: Instant,
}

#[derive(Debug, Clone, Copy)]
enum BreakerPhase {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

impl BreakerPhase {
    fn state(&self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            window: VecDeque::new(),
            half_open_in_flight: 0,
            last_state_change: now,
        }
    }

    fn failures(&self) -> u32 {
        self.window.iter().filter(|ok| !**ok).count() as u32
    }

    fn successes(&self) -> u32 {
        self.window.iter().filter(|ok| **ok).count() as u32
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.failures() as f64 / self.window.len() as f64
    }

    fn push(&mut self, ok: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    fn transition(&mut self, service: &str, to: BreakerPhase, trigger: &str, now: Instant) {
        let from = self.phase.state();
        let ratio = self.failure_ratio();
        self.phase = to;
        self.last_state_change = now;
        self.half_open_in_flight = 0;
        if !matches!(to, BreakerPhase::HalfOpen) {
            self.window.clear();
        }
        tracing::warn!(
            backend = service,
            from = %from,
            to = %to.state(),
            trigger,
            failure_ratio = ratio,
            "circuit breaker transition"
        );
    }
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Creates closed breakers for every backend known at startup.
    pub fn with_services<'a>(
        cfg: CircuitBreakerConfig,
        services: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let breaker = Self::new(cfg);
        let now = Instant::now();
        for service in services {
            breaker
                .states
                .insert(service.to_string(), Arc::new(Mutex::new(BreakerState::new(now))));
        }
        breaker
    }

    fn state_for(&self, service: &str) -> Arc<Mutex<BreakerState>> {
        self.states
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new(Instant::now()))))
            .clone()
    }

    fn open_duration(&self) -> Duration {
        Duration::from_secs(self.cfg.open_seconds)
    }

    /// Admission check before a backend call. An expired open window moves the
    /// breaker to half-open and admits the caller as a trial.
    pub async fn allow_request(&self, service: &str) -> bool {
        let state = self.state_for(service);
        let mut state = state.lock().await;
        let now = Instant::now();

        match state.phase {
            BreakerPhase::Closed => true,
            BreakerPhase::Open { until } => {
                if now >= until {
                    state.transition(service, BreakerPhase::HalfOpen, "open_window_elapsed", now);
                    state.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerPhase::HalfOpen => {
                if state.half_open_in_flight < self.cfg.half_open_max_requests {
                    state.half_open_in_flight += 1;
                    true
                } else if now.duration_since(state.last_state_change) >= self.open_duration() {
                    // trial outcome never arrived (caller went away); admit a new one
                    state.half_open_in_flight = 1;
                    state.last_state_change = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, service: &str) {
        let state = self.state_for(service);
        let mut state = state.lock().await;
        let now = Instant::now();

        match state.phase {
            BreakerPhase::Closed => state.push(true, self.cfg.window_size),
            BreakerPhase::HalfOpen => {
                state.transition(service, BreakerPhase::Closed, "trial_succeeded", now);
            }
            BreakerPhase::Open { .. } => {}
        }
    }

    pub async fn record_failure(&self, service: &str) {
        let state = self.state_for(service);
        let mut state = state.lock().await;
        let now = Instant::now();

        match state.phase {
            BreakerPhase::Closed => {
                state.push(false, self.cfg.window_size);
                if state.window.len() >= self.cfg.min_calls
                    && state.failure_ratio() > self.cfg.failure_threshold
                {
                    let until = now + self.open_duration();
                    state.transition(service, BreakerPhase::Open { until }, "failure_ratio", now);
                }
            }
            BreakerPhase::HalfOpen => {
                let until = now + self.open_duration();
                state.transition(service, BreakerPhase::Open { until }, "trial_failed", now);
            }
            BreakerPhase::Open { .. } => {}
        }
    }

    /// Opens a closed breaker on an external signal such as failed health probes.
    pub async fn trip(&self, service: &str, trigger: &str) {
        let state = self.state_for(service);
        let mut state = state.lock().await;
        if let BreakerPhase::Closed = state.phase {
            let now = Instant::now();
            let until = now + self.open_duration();
            state.transition(service, BreakerPhase::Open { until }, trigger, now);
        }
    }

    pub async fn snapshot(&self, service: &str) -> CircuitSnapshot {
        let state = self.state_for(service);
        let state = state.lock().await;
        CircuitSnapshot {
            state: state.phase.state(),
            failure_count: state.failures(),
            success_count: state.successes(),
            failure_ratio: state.failure_ratio(),
            seconds_since_change: state.last_state_change.elapsed().as_secs(),
        }
    }

    pub async fn open_count(&self) -> usize {
        let states: Vec<_> = self.states.iter().map(|e| e.value().clone()).collect();
        let mut open = 0;
        for state in states {
            if matches!(state.lock().await.phase, BreakerPhase::Open { .. }) {
                open += 1;
            }
        }
        open
    }
}
