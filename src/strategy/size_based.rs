//! Fires on batch size; time is only a generous fallback.

use super::{BatchStrategy, StrategyConfig, StrategyContext};
use crate::types::{Batch, CRITICAL_PRIORITY};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SizeBasedStrategy {
    config: StrategyConfig,
}

impl SizeBasedStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }
}

impl BatchStrategy for SizeBasedStrategy {
    fn name(&self) -> &str {
        "size-based"
    }

    fn should_process(&self, batch: &Batch) -> bool {
        let size = batch.len();
        if size >= batch.max_size || size >= self.config.max_batch_size {
            return true;
        }
        size >= self.config.min_batch_size && batch.priority >= CRITICAL_PRIORITY
    }

    fn optimal_batch_size(&self, ctx: &StrategyContext) -> usize {
        let mut size = self.config.max_batch_size as f64;
        if ctx.system_load > 0.8 {
            size *= 0.7;
        } else if ctx.system_load < 0.3 {
            size *= 1.2;
        }
        if ctx.recent_performance.error_rate > 0.1 {
            size *= 0.8;
        }
        self.config.clamp_size(size)
    }

    fn batch_timeout(&self, _ctx: &StrategyContext) -> Duration {
        self.config.max_wait_time * 2
    }
}
