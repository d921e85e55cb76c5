//! Minimum-interval request throttle for the HTTP adapters.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces requests at least `1 / requests_per_second` apart.
///
/// Callers queue on the mutex, so concurrent workers sharing one adapter
/// are serialized through the same schedule.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A rate of zero (or less) disables throttling.
    pub fn new(requests_per_second: f64) -> Self {
        let interval = if requests_per_second > 0.0 && requests_per_second.is_finite() {
            Some(Duration::from_secs_f64(1.0 / requests_per_second))
        } else {
            None
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait until the next request slot is available and claim it.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };

        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = *next {
            if slot > now {
                tokio::time::sleep_until(slot).await;
            }
        }
        *next = Some(Instant::now() + interval);
    }
}
