// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff for reconnect and restart loops.

use std::time::Duration;

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Doubling delay with jitter, capped at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and never exceeding `max`
    /// (before jitter).
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max) + jitter(self.current.min(self.max) / 10);
        self.current = self.current.saturating_mul(2);
        delay
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Up to `limit` of jitter, derived from a fresh UUID.
fn jitter(limit: Duration) -> Duration {
    let limit_ms = limit.as_millis() as u64;
    if limit_ms == 0 {
        return Duration::ZERO;
    }
    let random = uuid::Uuid::new_v4().as_u128() as u64;
    Duration::from_millis(random % limit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();
        let d4 = backoff.next_delay();

        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(110));
        assert!(d2 >= Duration::from_millis(200) && d2 < Duration::from_millis(220));
        assert!(d3 >= Duration::from_millis(400) && d3 < Duration::from_millis(440));
        assert!(d4 >= Duration::from_millis(400) && d4 < Duration::from_millis(440));
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() < BACKOFF_BASE * 2);
    }
}
