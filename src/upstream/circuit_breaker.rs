use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit breaker before a backend call.
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open — this is a probe request.
    Probe,
    /// Breaker is open — reject immediately.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub enabled: bool,
    pub state: &'static str,
    pub consecutive_failures: u32,
}

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Guards the logical backend: consecutive failures trip the breaker, the
/// open interval rejects without touching the backend, and a half-open
/// probe window decides between recovery and re-opening.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    /// Consecutive failure count (in Closed state).
    consecutive_failures: AtomicU32,
    /// Consecutive successes in HalfOpen state.
    half_open_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn check(&self) -> BreakerCheck {
        if !self.config.enabled {
            return BreakerCheck::Allowed;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_secs(self.config.open_duration_secs) {
                        // One winner flips to HalfOpen; the rest see the
                        // new state.
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Release);
                            return BreakerCheck::Probe;
                        }
                        return BreakerCheck::Probe;
                    }
                }
                BreakerCheck::Rejected
            }
            _ => BreakerCheck::Probe,
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    *self.opened_at.lock().unwrap() = None;
                    tracing::info!("upstream: circuit closed after recovery");
                }
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            STATE_HALF_OPEN => {
                // A failed probe reopens immediately.
                self.trip();
            }
            _ => {}
        }
    }

    fn trip(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        tracing::warn!(
            "upstream: circuit opened, failure_threshold={}",
            self.config.failure_threshold
        );
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => "closed",
            STATE_OPEN => "open",
            _ => "half_open",
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            enabled: self.config.enabled,
            state: self.state_name(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }
}
