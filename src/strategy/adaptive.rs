//! Learns size and timeout thresholds from recent batch outcomes.

use super::{scaled_timeout, BatchStrategy, StrategyConfig, StrategyContext};
use crate::types::{Batch, CRITICAL_PRIORITY};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Retained samples.
pub const HISTORY_CAPACITY: usize = 100;
/// Samples averaged for each decision.
pub const TRAILING_WINDOW: usize = 20;

/// Outcome of one completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: u64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub batch_size: usize,
    pub system_load: f64,
}

/// Size/time thresholds scale with a factor derived from the trailing-20 average:
/// `x0.7` when success < 0.9, `x0.8` when response time > 3000 ms, `x1.2` when
/// success > 0.98 and response time < 1000 ms. Critical batches always fire.
pub struct AdaptiveStrategy {
    config: StrategyConfig,
    history: Mutex<VecDeque<PerformanceSample>>,
}

impl AdaptiveStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current scaling factor; 1.0 without history.
    pub fn factor(&self) -> f64 {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let n = history.len().min(TRAILING_WINDOW);
        if n == 0 {
            return 1.0;
        }
        let (mut success, mut time) = (0.0, 0.0);
        for s in history.iter().rev().take(n) {
            success += s.success_rate;
            time += s.avg_response_time_ms;
        }
        let success = success / n as f64;
        let time = time / n as f64;

        let mut factor = 1.0;
        if success < 0.9 {
            factor *= 0.7;
        }
        if time > 3000.0 {
            factor *= 0.8;
        }
        if success > 0.98 && time < 1000.0 {
            factor *= 1.2;
        }
        factor
    }
}

impl std::fmt::Debug for AdaptiveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveStrategy")
            .field("config", &self.config)
            .field("history", &self.history_len())
            .finish()
    }
}

impl BatchStrategy for AdaptiveStrategy {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn should_process(&self, batch: &Batch) -> bool {
        if batch.priority >= CRITICAL_PRIORITY || batch.is_full() {
            return true;
        }
        let factor = self.factor();
        let size_target = (batch.max_size as f64 * factor)
            .round()
            .max(self.config.min_batch_size.max(1) as f64);
        batch.len() as f64 >= size_target || batch.age() >= batch.timeout.mul_f64(factor)
    }

    fn optimal_batch_size(&self, ctx: &StrategyContext) -> usize {
        let mut size = self.config.max_batch_size as f64 * self.factor();
        if ctx.system_load > 0.8 {
            size *= 0.8;
        }
        self.config.clamp_size(size)
    }

    fn batch_timeout(&self, _ctx: &StrategyContext) -> Duration {
        scaled_timeout(self.config.max_wait_time.as_millis() as f64 * self.factor())
    }

    fn record_performance(&self, sample: PerformanceSample) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(sample);
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::batch;

    fn sample(success_rate: f64, avg_response_time_ms: f64) -> PerformanceSample {
        PerformanceSample {
            timestamp: 0,
            avg_response_time_ms,
            success_rate,
            batch_size: 10,
            system_load: 0.5,
        }
    }

    fn strategy() -> AdaptiveStrategy {
        AdaptiveStrategy::new(StrategyConfig::new(1, 100, Duration::from_millis(1000)))
    }

    #[test]
    fn test_history_is_bounded() {
        let s = strategy();
        for _ in 0..150 {
            s.record_performance(sample(1.0, 100.0));
        }
        assert_eq!(s.history_len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_unhealthy_history_shrinks_thresholds() {
        let s = strategy();
        for _ in 0..20 {
            s.record_performance(sample(0.5, 4000.0));
        }
        assert!((s.factor() - 0.56).abs() < 1e-9);
        let ctx = StrategyContext::new("z1", "/tickets");
        assert_eq!(s.optimal_batch_size(&ctx), 56);
        assert_eq!(s.batch_timeout(&ctx), Duration::from_millis(560));
    }

    #[test]
    fn test_healthy_history_grows_thresholds() {
        let s = strategy();
        for _ in 0..20 {
            s.record_performance(sample(1.0, 200.0));
        }
        assert!((s.factor() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_only_trailing_window_counts() {
        let s = strategy();
        for _ in 0..50 {
            s.record_performance(sample(0.1, 9000.0));
        }
        for _ in 0..TRAILING_WINDOW {
            s.record_performance(sample(0.95, 1500.0));
        }
        assert!((s.factor() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_critical_always_fires() {
        let s = strategy();
        for _ in 0..20 {
            s.record_performance(sample(1.0, 100.0));
        }
        assert!(s.should_process(&batch(1, 9, 100, 60_000, Duration::ZERO)));
        assert!(!s.should_process(&batch(1, 5, 100, 60_000, Duration::ZERO)));
    }

    #[test]
    fn test_shrunk_size_target_fires_early() {
        let s = strategy();
        for _ in 0..20 {
            s.record_performance(sample(0.5, 500.0));
        }
        // factor 0.7: 7 of 10 is enough
        assert!(s.should_process(&batch(7, 3, 10, 60_000, Duration::ZERO)));
        assert!(!s.should_process(&batch(6, 3, 10, 60_000, Duration::ZERO)));
    }
}
