use crate::app::ports::{BibliographicLookupPort, CallContext};
use crate::error::LookupError;
use crate::rate_limiter::MinGapRateLimiter;
use crate::types::BibliographicRecord;
use async_trait::async_trait;
use std::sync::Arc;

/// Lookup decorator that waits on a shared rate limiter before every call.
pub struct RateLimitedLookup {
    inner: Arc<dyn BibliographicLookupPort>,
    limiter: MinGapRateLimiter,
}

impl RateLimitedLookup {
    pub fn new(inner: Arc<dyn BibliographicLookupPort>, limiter: MinGapRateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl BibliographicLookupPort for RateLimitedLookup {
    async fn lookup(
        &self,
        query: &str,
        ctx: &CallContext,
    ) -> Result<Option<BibliographicRecord>, LookupError> {
        // Time spent waiting for a slot does not count against the call's deadline
        self.limiter.acquire().await;
        self.inner.lookup(query, &ctx.restarted()).await
    }
}
