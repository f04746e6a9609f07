//! 批处理策略模块：决定批次何时触发以及最佳大小与超时。
//!
//! # Batch Strategies
//!
//! A strategy is a decision table over a batch's size, age and priority plus live system
//! context. The five built-ins form the closed [`StrategyKind`]; [`StrategyRegistry`] adds a
//! side table of named constructors for custom strategies.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchStrategy`] | Trigger, sizing and timeout decisions |
//! | [`StrategyKind`] | `size-based`, `time-based`, `hybrid`, `priority-aware`, `adaptive` |
//! | [`StrategyContext`] | Load, queue depth and recent performance at decision time |
//! | [`StrategyRegistry`] | Name to constructor lookup with runtime registration |
//!
//! ```rust
//! use api_batcher::strategy::{StrategyConfig, StrategyKind, StrategyRegistry};
//!
//! let registry = StrategyRegistry::new();
//! let hybrid = registry.create("hybrid", &StrategyConfig::default()).unwrap();
//! assert_eq!(hybrid.name(), StrategyKind::Hybrid.as_str());
//! assert!(registry.create("fastest", &StrategyConfig::default()).is_err());
//! ```

mod adaptive;
mod hybrid;
mod priority_aware;
mod size_based;
mod time_based;

pub use adaptive::{AdaptiveStrategy, PerformanceSample};
pub use hybrid::HybridStrategy;
pub use priority_aware::PriorityAwareStrategy;
pub use size_based::SizeBasedStrategy;
pub use time_based::TimeBasedStrategy;

use crate::metrics::RecentPerformance;
use crate::types::{epoch_millis, Batch, MAX_PROTOCOL_BATCH_SIZE};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Shortest timeout any built-in strategy will hand out.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Sizing bounds shared by all strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 5,
            max_batch_size: 100,
            max_wait_time: Duration::from_millis(1000),
        }
    }
}

impl StrategyConfig {
    pub fn new(min_batch_size: usize, max_batch_size: usize, max_wait_time: Duration) -> Self {
        Self {
            min_batch_size,
            max_batch_size,
            max_wait_time,
        }
    }

    /// Clamp `size` into `[min_batch_size, MAX_PROTOCOL_BATCH_SIZE]`.
    pub(crate) fn clamp_size(&self, size: f64) -> usize {
        let min = self.min_batch_size.max(1);
        let max = MAX_PROTOCOL_BATCH_SIZE.max(min);
        (size.round().max(0.0) as usize).clamp(min, max)
    }
}

/// Live system view handed to sizing and timeout decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyContext {
    /// Queue utilization in `[0, 1]`.
    pub system_load: f64,
    pub queue_depth: usize,
    pub active_batches: usize,
    pub recent_performance: RecentPerformance,
    pub zone: String,
    pub endpoint: String,
    pub timestamp: u64,
}

impl StrategyContext {
    pub fn new(zone: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            system_load: 0.0,
            queue_depth: 0,
            active_batches: 0,
            recent_performance: RecentPerformance::default(),
            zone: zone.into(),
            endpoint: endpoint.into(),
            timestamp: epoch_millis(),
        }
    }

    pub fn with_system_load(mut self, load: f64) -> Self {
        self.system_load = load.clamp(0.0, 1.0);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_active_batches(mut self, n: usize) -> Self {
        self.active_batches = n;
        self
    }

    pub fn with_recent_performance(mut self, perf: RecentPerformance) -> Self {
        self.recent_performance = perf;
        self
    }
}

/// Decides when a batch fires and how large and long-lived new batches should be.
pub trait BatchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `batch` should be dispatched now.
    fn should_process(&self, batch: &Batch) -> bool;

    fn optimal_batch_size(&self, ctx: &StrategyContext) -> usize;

    /// Auto-fire deadline for a batch created under `ctx`.
    fn batch_timeout(&self, ctx: &StrategyContext) -> Duration;

    /// Outcome feedback after a batch completes. Stateless strategies ignore it.
    fn record_performance(&self, _sample: PerformanceSample) {}
}

/// Built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    SizeBased,
    TimeBased,
    #[default]
    Hybrid,
    PriorityAware,
    Adaptive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::SizeBased,
        StrategyKind::TimeBased,
        StrategyKind::Hybrid,
        StrategyKind::PriorityAware,
        StrategyKind::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::SizeBased => "size-based",
            StrategyKind::TimeBased => "time-based",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::PriorityAware => "priority-aware",
            StrategyKind::Adaptive => "adaptive",
        }
    }

    pub fn build(&self, config: &StrategyConfig) -> Arc<dyn BatchStrategy> {
        let config = config.clone();
        match self {
            StrategyKind::SizeBased => Arc::new(SizeBasedStrategy::new(config)),
            StrategyKind::TimeBased => Arc::new(TimeBasedStrategy::new(config)),
            StrategyKind::Hybrid => Arc::new(HybridStrategy::new(config)),
            StrategyKind::PriorityAware => Arc::new(PriorityAwareStrategy::new(config)),
            StrategyKind::Adaptive => Arc::new(AdaptiveStrategy::new(config)),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| unknown_strategy(s))
    }
}

fn unknown_strategy(name: &str) -> Error {
    Error::configuration_with_context(
        format!("unknown batch strategy '{}'", name),
        ErrorContext::new()
            .with_field_path("default_strategy")
            .with_details("expected size-based, time-based, hybrid, priority-aware, adaptive or a registered name"),
    )
}

/// Constructor for a custom strategy.
pub type StrategyConstructor = Arc<dyn Fn(&StrategyConfig) -> Arc<dyn BatchStrategy> + Send + Sync>;

/// Name to strategy lookup: built-ins first, then registered constructors.
#[derive(Default)]
pub struct StrategyRegistry {
    custom: RwLock<HashMap<String, StrategyConstructor>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom strategy. Built-in names cannot be shadowed.
    pub fn register(&self, name: impl Into<String>, ctor: StrategyConstructor) -> Result<()> {
        let name = name.into();
        if StrategyKind::from_str(&name).is_ok() {
            return Err(Error::validation_with_context(
                format!("'{}' is a built-in strategy", name),
                ErrorContext::new().with_field_path("strategy.name"),
            ));
        }
        self.custom
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, ctor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        StrategyKind::from_str(name).is_ok()
            || self
                .custom
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(name)
    }

    /// Instantiate by name; unknown names are a configuration error.
    pub fn create(&self, name: &str, config: &StrategyConfig) -> Result<Arc<dyn BatchStrategy>> {
        if let Ok(kind) = StrategyKind::from_str(name) {
            return Ok(kind.build(config));
        }
        let ctor = self
            .custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_strategy(name))?;
        Ok(ctor(config))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = StrategyKind::ALL.iter().map(|k| k.as_str().to_string()).collect();
        let mut custom: Vec<String> = self
            .custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        custom.sort();
        names.extend(custom);
        names
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Timeout from a millisecond figure, floored at [`MIN_TIMEOUT`].
pub(crate) fn scaled_timeout(ms: f64) -> Duration {
    Duration::from_millis(ms.round().max(0.0) as u64).max(MIN_TIMEOUT)
}

/// `fraction` of `n`, as a comparable threshold.
pub(crate) fn share(n: usize, fraction: f64) -> f64 {
    n as f64 * fraction
}
