use crate::metrics::MetricsSnapshot;
use crate::queue::QueueStats;
use crate::resilience::{CircuitBreakerSnapshot, RateLimiterSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ManagerCounters {
    pub(crate) requests_received: AtomicU64,
    pub(crate) batches_created: AtomicU64,
    pub(crate) batches_submitted: AtomicU64,
    pub(crate) individual_dispatches: AtomicU64,
    pub(crate) requests_readmitted: AtomicU64,
    pub(crate) follow_ups: AtomicU64,
}

impl ManagerCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            individual_dispatches: self.individual_dispatches.load(Ordering::Relaxed),
            requests_readmitted: self.requests_readmitted.load(Ordering::Relaxed),
            follow_ups: self.follow_ups.load(Ordering::Relaxed),
        }
    }
}

/// Intake and dispatch counters since the manager started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub requests_received: u64,
    pub batches_created: u64,
    /// Batches handed to the optimizer and queue.
    pub batches_submitted: u64,
    /// Batches sent straight to a processor after the queue refused them.
    pub individual_dispatches: u64,
    /// Requests cut by adaptive sizing and admitted again.
    pub requests_readmitted: u64,
    /// Failed requests reported through follow-up events.
    pub follow_ups: u64,
}

/// Facts about the running pipeline. No policy is applied here; see
/// [`BatchManager::health`](super::BatchManager::health) for the verdict.
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    pub metrics: MetricsSnapshot,
    pub queue: QueueStats,
    pub circuit_breaker: CircuitBreakerSnapshot,
    /// Present while a steady-state throttle is configured or a rate-limit window is active.
    pub rate_limiter: Option<RateLimiterSnapshot>,
    pub default_strategy: String,
    pub in_flight_batches: usize,
    pub in_flight_requests: usize,
    /// Processor calls repeated by the retry wrapper.
    pub dispatch_retries: u64,
    pub counters: CounterSnapshot,
}
