//! Bounded linear retry schedules.
//!
//! Reachability probes retry a fixed number of times with a delay that grows
//! by a constant step: with the defaults the waits between five attempts are
//! 2s, 4s, 6s and 8s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Linear backoff: `attempts` tries, waiting `initial * n` before try `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearBackoff {
    /// Total number of attempts (at least 1)
    pub attempts: u32,
    /// Delay before the second attempt; later delays are multiples of it
    pub initial: Duration,
}

impl LinearBackoff {
    pub fn new(attempts: u32, initial: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts {
            return None;
        }
        Some(self.initial * attempt)
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}
