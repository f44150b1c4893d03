//! Minimum-interval gate for calls to a rate-limited external service.
//!
//! Nominatim's usage policy allows at most one request per second per
//! client; exceeding it gets the client blocked. The limiter is shared, so
//! any number of callers observe the same spacing.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a call is permitted and reserves the following slot.
    ///
    /// The lock is held while sleeping so concurrent callers queue up behind
    /// each other instead of waking together.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            if at > Instant::now() {
                tokio::time::sleep_until(at).await;
            }
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}
