use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum gap between the start times of any two outbound calls.
///
/// Each `acquire` reserves the next free start slot under the lock, then
/// sleeps until it outside the lock. Waiters are served in lock order.
#[derive(Debug, Clone)]
pub struct MinGapRateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    gap: Duration,
    last_slot: Mutex<Option<Instant>>,
}

impl MinGapRateLimiter {
    pub fn new(gap: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                gap,
                last_slot: Mutex::new(None),
            }),
        }
    }

    pub fn gap(&self) -> Duration {
        self.inner.gap
    }

    /// Wait until this caller may start its call.
    pub async fn acquire(&self) {
        if self.inner.gap.is_zero() {
            return;
        }

        let slot = {
            let mut last = self.inner.last_slot.lock().await;
            let now = Instant::now();
            let slot = match *last {
                Some(prev) => (prev + self.inner.gap).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };

        if slot > Instant::now() {
            tokio::time::sleep_until(slot).await;
        }
    }
}
