use std::time::{Duration, Instant};

/// Tracks consecutive rapid connection losses for a single shard.
///
/// Closes that land within `rapid_window` of the previous close count against
/// the budget; a close after a longer quiet gap resets the counter before
/// counting itself. The cap is therefore "N rapid failures in a row", not a
/// lifetime cap — a shard that ran for an hour and then drops gets a fresh
/// budget.
#[derive(Debug)]
pub struct RetryPolicy {
    rapid_window: Duration,
    max_rapid_retries: u32,
    tries: u32,
    last_close: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(rapid_window: Duration, max_rapid_retries: u32) -> Self {
        Self {
            rapid_window,
            max_rapid_retries,
            tries: 0,
            last_close: None,
        }
    }

    /// Record a connection loss at `now` and return the updated rapid-close
    /// count.
    pub fn record_close(&mut self, now: Instant) -> u32 {
        match self.last_close {
            Some(prev) if now.duration_since(prev) < self.rapid_window => {
                self.tries += 1;
            }
            _ => {
                self.tries = 1;
            }
        }
        self.last_close = Some(now);
        self.tries
    }

    /// Whether the rapid-retry budget is spent and the shard must stop
    /// reconnecting.
    pub fn is_exhausted(&self) -> bool {
        self.tries >= self.max_rapid_retries
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }
}
