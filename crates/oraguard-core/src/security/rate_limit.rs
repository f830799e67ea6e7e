//! Sliding-window rate limiting.
//!
//! One shared limiter guards every request kind. The window is a log of
//! admission timestamps; entries older than the window are expired on each
//! check, so memory stays bounded at `max` entries without a background
//! task.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::{GatewayError, Result};
use crate::utils::Clock;

/// Sliding-window admission limiter.
pub struct SlidingWindowLimiter {
    max:    usize,
    window: Duration,
    clock:  Arc<dyn Clock>,
    hits:   Mutex<VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `max` requests per `window_secs` seconds.
    #[must_use]
    pub fn new(max: usize, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max,
            window: Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX)),
            clock,
            hits: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Admit or reject one request.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::RateLimited` with a retry-after hint when the
    /// window is full.
    pub fn check(&self) -> Result<()> {
        let now = self.clock.now();
        let cutoff = now - self.window;

        // Only entries strictly older than the window expire; one exactly
        // `window` seconds old still counts.
        let mut hits = self.hits.lock();
        while hits.front().is_some_and(|&ts| ts < cutoff) {
            hits.pop_front();
        }

        if hits.len() >= self.max {
            let retry_after_secs = hits
                .front()
                .map(|&oldest| {
                    let remaining = (oldest + self.window - now).num_milliseconds();
                    let d = remaining / 1000;
                    let r = remaining % 1000;
                    let remaining_secs_ceil = if r > 0 { d + 1 } else { d };
                    remaining_secs_ceil.max(1)
                })
                .and_then(|secs| u64::try_from(secs).ok())
                .unwrap_or(1);
            return Err(GatewayError::rate_limited(
                format!(
                    "{} requests in the last {}s",
                    self.max,
                    self.window.num_seconds()
                ),
                retry_after_secs,
            ));
        }

        hits.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn limiter(max: usize, window_secs: u64) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::starting_now();
        let limiter = SlidingWindowLimiter::new(max, window_secs, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_admits_up_to_max() {
        let (limiter, _clock) = limiter(3, 60);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_window_slides() {
        let (limiter, clock) = limiter(2, 60);
        assert!(limiter.check().is_ok());
        clock.advance_secs(30);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());

        // The first entry leaves the window; one slot frees up.
        clock.advance_secs(31);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_entry_exactly_window_old_still_counts() {
        let (limiter, clock) = limiter(1, 60);
        assert!(limiter.check().is_ok());

        clock.advance_secs(60);
        assert!(limiter.check().is_err());

        clock.advance_secs(1);
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_retry_after_hint() {
        let (limiter, clock) = limiter(1, 60);
        assert!(limiter.check().is_ok());
        clock.advance_secs(15);

        match limiter.check() {
            Err(GatewayError::RateLimited {
                retry_after_secs, ..
            }) => assert_eq!(retry_after_secs, 45),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_bounded_by_expiry() {
        let (limiter, clock) = limiter(5, 60);
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        clock.advance_secs(61);
        assert!(limiter.check().is_ok());
        assert!(limiter.hits.lock().len() <= 5);
    }
}
