//! Queue statistics and health thresholds.

use crate::health::{HealthReport, HealthStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Utilization above which the queue is critical.
pub const CRITICAL_UTILIZATION: f64 = 0.9;
/// Utilization above which the queue is degraded.
pub const DEGRADED_UTILIZATION: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub average_processing_time_ms: f64,
    pub average_wait_time_ms: f64,
    /// `pending / max_queue_size`.
    pub queue_utilization: f64,
    /// Flat per-batch estimate, not a measurement.
    pub memory_usage_bytes: usize,
    pub memory_utilization: f64,
    pub max_concurrent_batches: usize,
    pub pending_by_priority: BTreeMap<u8, usize>,
    pub pending_by_zone: BTreeMap<String, usize>,
    pub processing_by_zone: BTreeMap<String, usize>,
}

impl QueueStats {
    pub fn at_concurrency_cap(&self) -> bool {
        self.max_concurrent_batches > 0 && self.processing >= self.max_concurrent_batches
    }

    /// Critical above 90% queue or memory utilization; degraded above 80% or when every
    /// processing slot is taken.
    pub fn health(&self) -> HealthReport {
        let mut report = HealthReport::healthy();
        if self.queue_utilization > CRITICAL_UTILIZATION {
            report.flag(
                HealthStatus::Critical,
                format!("queue utilization {:.0}%", self.queue_utilization * 100.0),
            );
        } else if self.queue_utilization > DEGRADED_UTILIZATION {
            report.flag(
                HealthStatus::Degraded,
                format!("queue utilization {:.0}%", self.queue_utilization * 100.0),
            );
        }
        if self.memory_utilization > CRITICAL_UTILIZATION {
            report.flag(
                HealthStatus::Critical,
                format!("memory utilization {:.0}%", self.memory_utilization * 100.0),
            );
        } else if self.memory_utilization > DEGRADED_UTILIZATION {
            report.flag(
                HealthStatus::Degraded,
                format!("memory utilization {:.0}%", self.memory_utilization * 100.0),
            );
        }
        if self.at_concurrency_cap() {
            report.flag(
                HealthStatus::Degraded,
                format!("all {} processing slots busy", self.max_concurrent_batches),
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(queue_utilization: f64, memory_utilization: f64) -> QueueStats {
        QueueStats {
            queue_utilization,
            memory_utilization,
            max_concurrent_batches: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_high_utilization_is_critical() {
        assert_eq!(stats(0.95, 0.0).health().status, HealthStatus::Critical);
        assert_eq!(stats(0.0, 0.95).health().status, HealthStatus::Critical);
    }

    #[test]
    fn test_degraded_band() {
        assert_eq!(stats(0.85, 0.0).health().status, HealthStatus::Degraded);
        assert_eq!(stats(0.5, 0.5).health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_full_concurrency_is_degraded() {
        let s = QueueStats {
            processing: 10,
            ..stats(0.1, 0.1)
        };
        let report = s.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.issues[0].contains("processing slots"));
    }
}
