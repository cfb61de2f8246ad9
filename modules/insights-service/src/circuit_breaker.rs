//! Circuit breaker around the LLM client.
//!
//! Closed: calls pass through, consecutive failures counted.
//! Open: calls rejected until the cooldown elapses.
//! Half-open: exactly one trial call is admitted; its outcome decides the
//! next state. Concurrent callers during the trial are rejected.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    cooldown: Duration,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Ask to make one downstream call. False means the circuit is open
    /// (or a half-open trial is already in flight) and the caller must not
    /// call. A true result must be followed by `record_success` or
    /// `record_failure`.
    pub fn begin_call(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    log::info!("[CIRCUIT] cooldown elapsed, admitting trial call");
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::HalfOpen => {
                log::info!("[CIRCUIT] trial succeeded, closing circuit");
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.trial_in_flight = false;
                state.opened_at = None;
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::HalfOpen => {
                log::warn!("[CIRCUIT] trial failed, reopening circuit");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
            }
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    log::warn!(
                        "[CIRCUIT] {} consecutive failures, opening circuit",
                        state.consecutive_failures
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().state
    }

    #[cfg(test)]
    fn force_cooldown_elapsed(&self) {
        let mut state = self.state.lock().unwrap();
        state.opened_at = Some(Instant::now() - self.cooldown);
    }
}
