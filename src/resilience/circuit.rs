//! Circuit breaker: closed → open → half-open → closed.

use std::sync::Arc;

use crate::clock::Clock;

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

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 30_000, success_threshold: 2 }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    opened_at_ms: u64,
    /// Non-failures per `is_failure`; defaults to counting everything.
    is_failure: fn(&str) -> bool,
}

fn always_failure(_message: &str) -> bool {
    true
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: CircuitState::Closed,
            failures: 0,
            half_open_successes: 0,
            opened_at_ms: 0,
            is_failure: always_failure,
        }
    }

    pub fn with_failure_predicate(mut self, is_failure: fn(&str) -> bool) -> Self {
        self.is_failure = is_failure;
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `(remaining_ms, failures)` for building a CircuitOpen error.
    pub fn open_status(&self) -> (u64, u32) {
        let elapsed = self.clock.now_millis().saturating_sub(self.opened_at_ms);
        (self.config.reset_timeout_ms.saturating_sub(elapsed), self.failures)
    }

    /// Gate check. In open state this transitions to half-open once the
    /// reset timeout has elapsed.
    pub fn is_allowed(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(self.opened_at_ms);
                if elapsed >= self.config.reset_timeout_ms {
                    self.transition(CircuitState::HalfOpen);
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.failures = 0;
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, message: &str) {
        if !(self.is_failure)(message) {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    self.opened_at_ms = self.clock.now_millis();
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.failures += 1;
                self.opened_at_ms = self.clock.now_millis();
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        crate::logging::json_log(
            crate::logging::Domain::System,
            "circuit_state",
            crate::logging::obj(&[
                ("from", crate::logging::v_str(self.state.as_str())),
                ("to", crate::logging::v_str(next.as_str())),
                ("failures", serde_json::json!(self.failures)),
            ]),
        );
        self.state = next;
    }
}
