//! Fires on batch age; size is an emergency fallback.

use super::{scaled_timeout, BatchStrategy, StrategyConfig, StrategyContext};
use crate::types::{Batch, CRITICAL_PRIORITY};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TimeBasedStrategy {
    config: StrategyConfig,
}

impl TimeBasedStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }
}

impl BatchStrategy for TimeBasedStrategy {
    fn name(&self) -> &str {
        "time-based"
    }

    fn should_process(&self, batch: &Batch) -> bool {
        batch.priority >= CRITICAL_PRIORITY || batch.age() >= batch.timeout || batch.is_full()
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
            ms *= 0.5;
        }
        if ctx.queue_depth > 100 {
            ms *= 0.7;
        }
        scaled_timeout(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::batch;
    use crate::strategy::MIN_TIMEOUT;

    fn strategy() -> TimeBasedStrategy {
        TimeBasedStrategy::new(StrategyConfig::new(1, 10, Duration::from_millis(1000)))
    }

    #[test]
    fn test_fires_on_age_priority_or_full() {
        let s = strategy();
        assert!(!s.should_process(&batch(2, 5, 10, 10_000, Duration::ZERO)));
        assert!(s.should_process(&batch(2, 5, 10, 50, Duration::from_millis(100))));
        assert!(s.should_process(&batch(1, 9, 10, 10_000, Duration::ZERO)));
        assert!(s.should_process(&batch(10, 1, 10, 10_000, Duration::ZERO)));
    }

    #[test]
    fn test_timeout_shrinks_under_pressure() {
        let s = strategy();
        let ctx = StrategyContext::new("z1", "/tickets");
        assert_eq!(s.batch_timeout(&ctx), Duration::from_millis(1000));
        assert_eq!(
            s.batch_timeout(&ctx.clone().with_system_load(0.9)),
            Duration::from_millis(500)
        );
        assert_eq!(
            s.batch_timeout(&ctx.with_system_load(0.9).with_queue_depth(500)),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn test_timeout_has_floor() {
        let s = TimeBasedStrategy::new(StrategyConfig::new(1, 10, Duration::from_millis(120)));
        let ctx = StrategyContext::new("z1", "/t").with_system_load(1.0).with_queue_depth(1000);
        assert_eq!(s.batch_timeout(&ctx), MIN_TIMEOUT);
    }
}
