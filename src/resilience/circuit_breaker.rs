use crate::events::{BatchEvent, EventBus};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub enabled: bool,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Retry hint handed to callers turned away while the half-open trial call runs.
    pub half_open_retry: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_retry: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding calls to a batch processor.
///
/// - Counts consecutive failures; opens at the threshold for `cooldown`
/// - After the cooldown a single trial call is let through (half-open)
/// - A successful trial call closes the circuit, a failed one re-opens it
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
            events: None,
        }
    }

    /// Report state transitions as `circuit.state.changed` on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }
        info!(from = ?from, to = ?to, "circuit breaker state changed");
        if let Some(bus) = &self.events {
            bus.emit(BatchEvent::CircuitStateChanged { from, to });
        }
    }

    pub fn allow(&self) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let (result, change) = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed => (Ok(()), None),
                CircuitState::Open => {
                    let now = Instant::now();
                    match st.open_until {
                        Some(until) if now < until => (
                            Err(Error::CircuitOpen {
                                // rounded up so a caller sleeping this long finds the cooldown over
                                retry_in_ms: (until - now).as_nanos().div_ceil(1_000_000) as u64,
                                half_open: false,
                            }),
                            None,
                        ),
                        // cooldown expired
                        _ => {
                            st.state = CircuitState::HalfOpen;
                            st.open_until = None;
                            st.trial_in_flight = true;
                            (Ok(()), Some((CircuitState::Open, CircuitState::HalfOpen)))
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    if st.trial_in_flight {
                        let retry_in_ms = (self.cfg.half_open_retry.as_millis() as u64).max(1);
                        (
                            Err(Error::CircuitOpen {
                                retry_in_ms,
                                half_open: true,
                            }),
                            None,
                        )
                    } else {
                        st.trial_in_flight = true;
                        (Ok(()), None)
                    }
                }
            }
        };
        if let Some((from, to)) = change {
            self.transition(from, to);
        }
        result
    }

    pub fn on_success(&self) {
        let from = {
            let mut st = self.lock();
            let from = st.state;
            st.state = CircuitState::Closed;
            st.consecutive_failures = 0;
            st.open_until = None;
            st.trial_in_flight = false;
            from
        };
        self.transition(from, CircuitState::Closed);
    }

    pub fn on_failure(&self) {
        let (from, to) = {
            let mut st = self.lock();
            let from = st.state;
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            st.trial_in_flight = false;
            let reopen = from == CircuitState::HalfOpen
                || st.consecutive_failures >= self.cfg.failure_threshold;
            if reopen {
                st.state = CircuitState::Open;
                st.open_until = Some(Instant::now() + self.cfg.cooldown);
            }
            (from, st.state)
        };
        self.transition(from, to);
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        match op().await {
            Ok(v) => {
                if self.cfg.enabled {
                    self.on_success();
                }
                Ok(v)
            }
            Err(e) => {
                if self.cfg.enabled {
                    self.on_failure();
                }
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining_ms = st.open_until.and_then(|until| {
            if until > now {
                Some((until - now).as_millis() as u64)
            } else {
                None
            }
        });
        CircuitBreakerSnapshot {
            enabled: self.cfg.enabled,
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_half_open_retry(mut self, wait: Duration) -> Self {
        self.half_open_retry = wait;
        self
    }
}
