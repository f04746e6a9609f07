//! Per-priority-band size and age thresholds.

use super::{scaled_timeout, share, BatchStrategy, StrategyConfig, StrategyContext};
use crate::types::{Batch, CRITICAL_PRIORITY};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PriorityAwareStrategy {
    config: StrategyConfig,
}

impl PriorityAwareStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// `(size fraction, age fraction)` of max size and timeout at which a priority fires.
    fn thresholds(priority: u8) -> (f64, f64) {
        match priority {
            p if p >= CRITICAL_PRIORITY => (0.0, 0.0),
            7..=8 => (0.3, 0.5),
            5..=6 => (0.6, 0.8),
            _ => (1.0, 1.0),
        }
    }
}

impl BatchStrategy for PriorityAwareStrategy {
    fn name(&self) -> &str {
        "priority-aware"
    }

    fn should_process(&self, batch: &Batch) -> bool {
        if batch.priority >= CRITICAL_PRIORITY {
            return true;
        }
        let (size_frac, age_frac) = Self::thresholds(batch.priority);
        batch.len() as f64 >= share(batch.max_size, size_frac)
            || batch.age() >= batch.timeout.mul_f64(age_frac)
    }

    fn optimal_batch_size(&self, ctx: &StrategyContext) -> usize {
        let mut size = self.config.max_batch_size as f64;
        if ctx.system_load > 0.8 {
            size *= 0.8;
        }
        self.config.clamp_size(size)
    }

    fn batch_timeout(&self, ctx: &StrategyContext) -> Duration {
        let mut ms = self.config.max_wait_time.as_millis() as f64;
        if ctx.system_load > 0.8 {
            ms *= 0.6;
        }
        scaled_timeout(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::batch;

    fn strategy() -> PriorityAwareStrategy {
        PriorityAwareStrategy::new(StrategyConfig::new(1, 10, Duration::from_millis(1000)))
    }

    const FRESH: Duration = Duration::ZERO;

    #[test]
    fn test_critical_is_instant() {
        assert!(strategy().should_process(&batch(1, 9, 10, 60_000, FRESH)));
    }

    #[test]
    fn test_high_band() {
        let s = strategy();
        assert!(s.should_process(&batch(3, 8, 10, 60_000, FRESH)));
        assert!(!s.should_process(&batch(2, 8, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 7, 10, 1000, Duration::from_millis(600))));
    }

    #[test]
    fn test_normal_band() {
        let s = strategy();
        assert!(s.should_process(&batch(6, 5, 10, 60_000, FRESH)));
        assert!(!s.should_process(&batch(5, 6, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 5, 10, 1000, Duration::from_millis(900))));
    }

    #[test]
    fn test_low_band_needs_full_or_expired() {
        let s = strategy();
        assert!(!s.should_process(&batch(9, 4, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(10, 1, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 1, 10, 100, Duration::from_millis(200))));
    }
}
