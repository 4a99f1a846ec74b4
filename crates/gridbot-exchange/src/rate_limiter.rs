//! Sliding-window request limiter.
//!
//! Venue limits are per API key, so one limiter is shared by every bot
//! trading through the same account.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Allows at most `max_requests` acquisitions in any `window`.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        Self::prune(&mut timestamps, now, self.window);

        if timestamps.len() >= self.max_requests as usize {
            return false;
        }
        timestamps.push_back(now);
        if timestamps.len() == self.max_requests as usize {
            warn!(
                count = timestamps.len(),
                max = self.max_requests,
                "Rate limit window full"
            );
        }
        true
    }

    /// Wait until a slot frees, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut timestamps = self.timestamps.lock();
                Self::prune(&mut timestamps, now, self.window);
                if timestamps.len() < self.max_requests as usize {
                    timestamps.push_back(now);
                    return;
                }
                timestamps
                    .front()
                    .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                    .unwrap_or_default()
            };
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit capacity");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn current_count(&self) -> u32 {
        let mut timestamps = self.timestamps.lock();
        Self::prune(&mut timestamps, Instant::now(), self.window);
        timestamps.len() as u32
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.max_requests.saturating_sub(self.current_count())
    }

    pub fn reset(&self) {
        self.timestamps.lock().clear();
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while timestamps
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= window)
        {
            timestamps.pop_front();
        }
    }
}
