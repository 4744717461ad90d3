//! Metrics for the enrichment engine.
//!
//! Recording is a no-op until an exporter is installed (see
//! [`crate::observability::init_metrics`]).

use std::fmt;
use std::time::Instant;

/// All metric names used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Lookup client
    LookupCompleted,
    LookupDuration,

    // Resolver
    ResolveOutcomes,

    // Cover cache
    CacheHits,
    CacheMisses,
    CacheRecentMissSkips,
    CacheInFlightJoins,
    CacheWriteErrors,

    // Scheduler
    SchedulerBatches,
    SchedulerTasks,
    SchedulerResolved,
    SchedulerBatchDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::LookupCompleted => "enricher_lookup_completed_total",
            MetricName::LookupDuration => "enricher_lookup_duration_seconds",
            MetricName::ResolveOutcomes => "enricher_resolve_outcomes_total",
            MetricName::CacheHits => "enricher_cache_hits_total",
            MetricName::CacheMisses => "enricher_cache_misses_total",
            MetricName::CacheRecentMissSkips => "enricher_cache_recent_miss_skips_total",
            MetricName::CacheInFlightJoins => "enricher_cache_in_flight_joins_total",
            MetricName::CacheWriteErrors => "enricher_cache_write_errors_total",
            MetricName::SchedulerBatches => "enricher_scheduler_batches_total",
            MetricName::SchedulerTasks => "enricher_scheduler_tasks_total",
            MetricName::SchedulerResolved => "enricher_scheduler_resolved_total",
            MetricName::SchedulerBatchDuration => "enricher_scheduler_batch_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records elapsed seconds into a histogram when dropped.
pub struct TimingGuard {
    start: Instant,
    name: MetricName,
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        ::metrics::histogram!(self.name.as_str()).record(self.start.elapsed().as_secs_f64());
    }
}

pub fn time_operation(name: MetricName) -> TimingGuard {
    TimingGuard {
        start: Instant::now(),
        name,
    }
}

pub mod lookup {
    use super::MetricName;

    /// One outbound call finished with `outcome` (found, empty, timeout, transport_error)
    pub fn completed(outcome: &'static str) {
        ::metrics::counter!(MetricName::LookupCompleted.as_str(), "outcome" => outcome).increment(1);
    }
}

pub mod resolver {
    use super::MetricName;

    pub fn outcome(kind: &'static str) {
        ::metrics::counter!(MetricName::ResolveOutcomes.as_str(), "kind" => kind).increment(1);
    }
}

pub mod cache {
    use super::MetricName;

    pub fn hit() {
        ::metrics::counter!(MetricName::CacheHits.as_str()).increment(1);
    }

    pub fn miss() {
        ::metrics::counter!(MetricName::CacheMisses.as_str()).increment(1);
    }

    pub fn recent_miss_skipped() {
        ::metrics::counter!(MetricName::CacheRecentMissSkips.as_str()).increment(1);
    }

    pub fn in_flight_joined() {
        ::metrics::counter!(MetricName::CacheInFlightJoins.as_str()).increment(1);
    }

    pub fn write_failed() {
        ::metrics::counter!(MetricName::CacheWriteErrors.as_str()).increment(1);
    }
}

pub mod scheduler {
    use super::MetricName;

    pub fn batch_finished(tasks: usize, resolved: usize, seconds: f64) {
        ::metrics::counter!(MetricName::SchedulerBatches.as_str()).increment(1);
        ::metrics::counter!(MetricName::SchedulerTasks.as_str()).increment(tasks as u64);
        ::metrics::counter!(MetricName::SchedulerResolved.as_str()).increment(resolved as u64);
        ::metrics::histogram!(MetricName::SchedulerBatchDuration.as_str()).record(seconds);
    }
}
