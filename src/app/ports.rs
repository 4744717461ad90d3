use crate::error::{LookupError, Result};
use crate::types::{BibliographicRecord, CacheEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline carried into one outbound call.
///
/// Adapters must bound all of their awaiting by [`CallContext::run`] so an
/// expired deadline always surfaces as [`LookupError::Timeout`].
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    deadline: Instant,
    timeout: Duration,
}

impl CallContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Same timeout, counted from now.
    pub fn restarted(&self) -> Self {
        Self::with_timeout(self.timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub async fn run<F, T>(&self, fut: F) -> std::result::Result<T, LookupError>
    where
        F: Future<Output = std::result::Result<T, LookupError>>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout),
        }
    }
}

/// Remote bibliographic lookup service.
///
/// `Ok(None)` means the service answered but had no matching item.
#[async_trait]
pub trait BibliographicLookupPort: Send + Sync {
    async fn lookup(
        &self,
        query: &str,
        ctx: &CallContext,
    ) -> std::result::Result<Option<BibliographicRecord>, LookupError>;
}

/// Durable key-value backing for the cover cache.
#[async_trait]
pub trait CacheStorePort: Send + Sync {
    /// Read every entry. Unreadable content yields an empty map.
    async fn load_all(&self) -> HashMap<String, CacheEntry>;
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;
}

pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic freshness tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl ClockPort for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_context_times_out() {
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let result: std::result::Result<(), LookupError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(LookupError::Timeout));
    }

    #[tokio::test]
    async fn test_call_context_passes_through() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let result = ctx.run(async { Ok::<_, LookupError>(7) }).await;
        assert_eq!(result, Ok(7));
        assert!(!ctx.is_expired());
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(clock.now() - start, chrono::Duration::hours(2));
    }
}
