//! Default strategy: size, age and priority combined in graduated steps.

use super::{scaled_timeout, share, BatchStrategy, StrategyConfig, StrategyContext};
use crate::types::{Batch, CRITICAL_PRIORITY};
use std::time::Duration;

/// Fires when any of the following holds, checked in order:
///
/// | condition | |
/// |---|---|
/// | size >= max | full |
/// | priority >= 9 | critical |
/// | age >= timeout | expired |
/// | priority >= 7 and size >= 40% of max | high priority, partly full |
/// | priority >= 5 and (size >= 60% of max or age >= 70% of timeout) | normal priority |
/// | size >= min and age >= 30% of timeout | minimum reached, aging |
#[derive(Debug, Clone)]
pub struct HybridStrategy {
    config: StrategyConfig,
}

impl HybridStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }
}

impl BatchStrategy for HybridStrategy {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn should_process(&self, batch: &Batch) -> bool {
        let size = batch.len();
        let max = batch.max_size;
        let age = batch.age();
        let timeout = batch.timeout;
        let priority = batch.priority;

        if size >= max || priority >= CRITICAL_PRIORITY || age >= timeout {
            return true;
        }
        let sizef = size as f64;
        if priority >= 7 && sizef >= share(max, 0.4) {
            return true;
        }
        if priority >= 5 && (sizef >= share(max, 0.6) || age >= timeout.mul_f64(0.7)) {
            return true;
        }
        size >= self.config.min_batch_size && age >= timeout.mul_f64(0.3)
    }

    fn optimal_batch_size(&self, ctx: &StrategyContext) -> usize {
        let mut size = self.config.max_batch_size as f64;
        if ctx.system_load > 0.8 {
            size *= 0.75;
        } else if ctx.system_load < 0.3 {
            size *= 1.1;
        }
        if ctx.recent_performance.error_rate > 0.1 {
            size *= 0.8;
        }
        if ctx.queue_depth > 100 {
            size *= 0.9;
        }
        self.config.clamp_size(size)
    }

    fn batch_timeout(&self, ctx: &StrategyContext) -> Duration {
        let mut ms = self.config.max_wait_time.as_millis() as f64;
        if ctx.system_load > 0.8 {
            ms *= 0.7;
        }
        if ctx.queue_depth > 100 {
            ms *= 0.8;
        }
        scaled_timeout(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::batch;

    fn strategy() -> HybridStrategy {
        HybridStrategy::new(StrategyConfig::new(5, 10, Duration::from_millis(1000)))
    }

    const FRESH: Duration = Duration::ZERO;

    #[test]
    fn test_full_critical_and_expired() {
        let s = strategy();
        assert!(s.should_process(&batch(10, 1, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 9, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 1, 10, 100, Duration::from_millis(200))));
    }

    #[test]
    fn test_high_priority_at_forty_percent() {
        let s = strategy();
        assert!(s.should_process(&batch(4, 7, 10, 60_000, FRESH)));
        assert!(!s.should_process(&batch(3, 7, 10, 60_000, FRESH)));
    }

    #[test]
    fn test_normal_priority_at_sixty_percent_or_seventy_percent_age() {
        let s = strategy();
        assert!(s.should_process(&batch(6, 5, 10, 60_000, FRESH)));
        assert!(!s.should_process(&batch(4, 5, 10, 60_000, FRESH)));
        assert!(s.should_process(&batch(1, 5, 10, 1000, Duration::from_millis(800))));
        assert!(!s.should_process(&batch(1, 5, 10, 10_000, Duration::from_millis(2000))));
    }

    #[test]
    fn test_low_priority_needs_min_size_and_thirty_percent_age() {
        let s = strategy();
        assert!(!s.should_process(&batch(5, 3, 10, 10_000, FRESH)));
        assert!(s.should_process(&batch(5, 3, 10, 10_000, Duration::from_millis(4000))));
        assert!(!s.should_process(&batch(4, 3, 10, 10_000, Duration::from_millis(4000))));
        // 60% size only counts from priority 5
        assert!(!s.should_process(&batch(6, 4, 10, 60_000, FRESH)));
    }

    #[test]
    fn test_sizing_under_load() {
        let s = HybridStrategy::new(StrategyConfig::new(5, 100, Duration::from_millis(1000)));
        let ctx = StrategyContext::new("z1", "/tickets");
        assert_eq!(s.optimal_batch_size(&ctx.clone().with_system_load(0.5)), 100);
        assert_eq!(s.optimal_batch_size(&ctx.clone().with_system_load(0.9)), 75);
        assert_eq!(s.batch_timeout(&ctx.with_system_load(0.9)), Duration::from_millis(700));
    }
}
