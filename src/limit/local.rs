use crate::limit::window::{now_ms, SlidingWindow};

/// Outcome of a local admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Count within `max_requests`.
    Admitted,
    /// Count between `max_requests` and `max_requests + burst_size`:
    /// admitted, but the overshoot is logged.
    Burst,
    Denied,
}

impl Acquire {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Acquire::Denied)
    }
}

/// Fast in-process limiter over a single window.
///
/// Burst headroom applies within one window only; it is never borrowed
/// across rotations. `try_acquire` never blocks and fails closed only when
/// `max_requests` is configured to 0.
pub struct LocalRateLimiter {
    name: String,
    max_requests: u64,
    burst_size: u64,
    window: SlidingWindow,
}

impl LocalRateLimiter {
    pub fn new(name: impl Into<String>, max_requests: u64, burst_size: u64, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            burst_size,
            window: SlidingWindow::new(window_ms),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_acquire(&self) -> Acquire {
        self.try_acquire_at(now_ms())
    }

    /// Admission against an explicit clock, for deterministic tests.
    pub fn try_acquire_at(&self, now: u64) -> Acquire {
        if self.max_requests == 0 {
            return Acquire::Denied;
        }
        let count = self.window.increment(now);
        if count <= self.max_requests {
            Acquire::Admitted
        } else if count <= self.max_requests + self.burst_size {
            tracing::debug!(
                "limit: burst region, name={}, count={}, max={}",
                self.name,
                count,
                self.max_requests
            );
            Acquire::Burst
        } else {
            Acquire::Denied
        }
    }

    /// Current window count, for the metrics engine and stats endpoints.
    pub fn current_count(&self) -> u64 {
        self.window.current(now_ms())
    }

    pub fn idle_ms(&self, now: u64) -> u64 {
        self.window.idle_ms(now)
    }
}
