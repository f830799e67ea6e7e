//! Circuit breaker guarding every database call.
//!
//! Three phases:
//!
//! - **Closed**: normal operation; consecutive failures are counted
//! - **Open**: all calls refused with the remaining cool-down, without
//!   touching the pool
//! - **`HalfOpen`**: probing; consecutive successes close the circuit, any
//!   failure re-opens it
//!
//! Transitions:
//!
//! | From     | Event   | To       |
//! |----------|---------|----------|
//! | Closed   | failure | Closed, or Open at the failure threshold |
//! | Closed   | success | Closed (failure count reset) |
//! | Open     | permit  | Open until the cool-down elapses, then `HalfOpen` |
//! | HalfOpen | success | `HalfOpen`, or Closed at the success threshold |
//! | HalfOpen | failure | Open (cool-down restarts) |
//!
//! State changes are returned as values so the dispatcher can turn them
//! into audit events instead of logging from in here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::GatewayError;
use crate::utils::Clock;

/// Circuit phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    /// Normal operation.
    Closed,
    /// Refusing all calls.
    Open,
    /// Probing for recovery.
    HalfOpen,
}

impl CircuitPhase {
    /// Audit-facing phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase transition observed while handling one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseChange {
    /// The circuit opened.
    Opened,
    /// The cool-down elapsed; a probe is admitted.
    HalfOpened,
    /// Recovery confirmed; the circuit closed.
    Closed,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold:     u32,
    /// Cool-down before probing, in seconds.
    pub recovery_timeout_secs: u64,
    /// Consecutive probe successes before closing.
    pub success_threshold:     u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold:     5,
            recovery_timeout_secs: 60,
            success_threshold:     2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    phase:                 CircuitPhase,
    consecutive_failures:  u32,
    consecutive_successes: u32,
    opened_at:             Option<DateTime<Utc>>,
}

/// Process-wide circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock:  Arc<dyn Clock>,
    state:  Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker in the Closed phase.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState {
                phase:                 CircuitPhase::Closed,
                consecutive_failures:  0,
                consecutive_successes: 0,
                opened_at:             None,
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    /// Ask to make a database call.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::CircuitOpen` with the remaining cool-down
    /// while the circuit is open. When the cool-down has elapsed the call
    /// is admitted as a probe and `Some(PhaseChange::HalfOpened)` is
    /// returned.
    pub fn permit(&self) -> Result<Option<PhaseChange>, GatewayError> {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed | CircuitPhase::HalfOpen => Ok(None),
            CircuitPhase::Open => {
                let now = self.clock.now();
                let opened_at = state.opened_at.unwrap_or(now);
                let recovery = Duration::seconds(
                    i64::try_from(self.config.recovery_timeout_secs).unwrap_or(i64::MAX),
                );
                let elapsed = now - opened_at;

                if elapsed >= recovery {
                    state.phase = CircuitPhase::HalfOpen;
                    state.consecutive_successes = 0;
                    Ok(Some(PhaseChange::HalfOpened))
                } else {
                    let remaining = (recovery - elapsed).num_milliseconds();
                    let remaining_secs_ceil = {
                        let d = remaining / 1000;
                        let r = remaining % 1000;
                        if r > 0 { d + 1 } else { d }
                    };
                    let retry_after_secs =
                        u64::try_from(remaining_secs_ceil.max(1)).unwrap_or(1);
                    Err(GatewayError::CircuitOpen { retry_after_secs })
                }
            },
        }
    }

    /// Record a successful database call.
    pub fn record_success(&self) -> Option<PhaseChange> {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => {
                state.consecutive_failures = 0;
                None
            },
            CircuitPhase::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.phase = CircuitPhase::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                    Some(PhaseChange::Closed)
                } else {
                    None
                }
            },
            CircuitPhase::Open => None,
        }
    }

    /// Record a failed database call.
    pub fn record_failure(&self) -> Option<PhaseChange> {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.phase = CircuitPhase::Open;
                    state.opened_at = Some(self.clock.now());
                    Some(PhaseChange::Opened)
                } else {
                    None
                }
            },
            CircuitPhase::HalfOpen => {
                state.phase = CircuitPhase::Open;
                state.opened_at = Some(self.clock.now());
                state.consecutive_successes = 0;
                Some(PhaseChange::Opened)
            },
            CircuitPhase::Open => None,
        }
    }
}
