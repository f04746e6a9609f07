//! Manager configuration, presets and loading.

use crate::optimizer::OptimizerConfig;
use crate::queue::{DequeueStrategy, QueueConfig};
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use crate::strategy::{StrategyConfig, StrategyKind};
use crate::types::MAX_PROTOCOL_BATCH_SIZE;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    /// Open-state cooldown.
    pub timeout_ms: u64,
    /// How long a batch turned away by the half-open trial call waits before it is re-queued.
    pub half_open_retry_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_ms: 60_000,
            half_open_retry_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    pub max_memory_mb: usize,
    pub max_concurrent_batches: usize,
    pub dequeue_strategy: DequeueStrategy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_memory_mb: 100,
            max_concurrent_batches: 10,
            dequeue_strategy: DequeueStrategy::Priority,
        }
    }
}

/// Everything the batch manager can be tuned with.
///
/// Keys are snake_case; durations are `*_ms` integers. Missing keys take the `default`
/// preset values.
///
/// ```rust
/// use api_batcher::manager::BatchManagerConfig;
///
/// let cfg = BatchManagerConfig::from_yaml_str("max_batch_size: 50\ndefault_strategy: adaptive\n").unwrap();
/// assert_eq!(cfg.max_batch_size, 50);
/// assert_eq!(cfg.min_batch_size, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchManagerConfig {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub max_wait_time_ms: u64,
    pub default_strategy: StrategyKind,
    pub enable_deduplication: bool,
    pub enable_coalescing: bool,
    pub enable_adaptive_sizing: bool,
    pub enable_priority_optimization: bool,
    pub enable_zone_optimization: bool,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub queue: QueueSettings,
    /// Dispatches per second; unset disables throttling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_rps: Option<f64>,
    /// Token bucket size; defaults to one second worth of `rate_limit_rps`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_burst: Option<u32>,
    /// Delay before failed requests are reported for follow-up.
    pub follow_up_delay_ms: u64,
    pub scheduler_poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Accepted for compatibility; the queue is always in-memory.
    pub persistent: bool,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            min_batch_size: 5,
            max_wait_time_ms: 1000,
            default_strategy: StrategyKind::Hybrid,
            enable_deduplication: true,
            enable_coalescing: true,
            enable_adaptive_sizing: true,
            enable_priority_optimization: true,
            enable_zone_optimization: true,
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            queue: QueueSettings::default(),
            rate_limit_rps: None,
            rate_limit_burst: None,
            follow_up_delay_ms: 5000,
            scheduler_poll_interval_ms: 100,
            shutdown_timeout_ms: 30_000,
            persistent: false,
        }
    }
}

/// Named presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Default,
    HighThroughput,
    LowLatency,
    Development,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Default,
        Preset::HighThroughput,
        Preset::LowLatency,
        Preset::Development,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Default => "default",
            Preset::HighThroughput => "high-throughput",
            Preset::LowLatency => "low-latency",
            Preset::Development => "development",
        }
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("unknown preset '{}'", s),
                    ErrorContext::new()
                        .with_details("expected default, high-throughput, low-latency or development"),
                )
            })
    }
}

impl BatchManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Default => Self::default(),
            Preset::HighThroughput => Self {
                max_batch_size: 500,
                min_batch_size: 50,
                max_wait_time_ms: 2000,
                default_strategy: StrategyKind::SizeBased,
                enable_deduplication: true,
                enable_coalescing: false,
                enable_adaptive_sizing: true,
                retry: RetrySettings {
                    max_retries: 2,
                    base_delay_ms: 500,
                    backoff_multiplier: 2.0,
                    max_delay_ms: 5000,
                },
                circuit_breaker: CircuitBreakerSettings {
                    enabled: true,
                    failure_threshold: 10,
                    timeout_ms: 30_000,
                    ..CircuitBreakerSettings::default()
                },
                queue: QueueSettings {
                    max_queue_size: 5000,
                    max_concurrent_batches: 20,
                    ..QueueSettings::default()
                },
                ..Self::default()
            },
            Preset::LowLatency => Self {
                max_batch_size: 20,
                min_batch_size: 1,
                max_wait_time_ms: 100,
                default_strategy: StrategyKind::TimeBased,
                enable_deduplication: true,
                enable_coalescing: false,
                enable_adaptive_sizing: false,
                retry: RetrySettings {
                    max_retries: 1,
                    base_delay_ms: 100,
                    backoff_multiplier: 1.5,
                    max_delay_ms: 1000,
                },
                circuit_breaker: CircuitBreakerSettings {
                    enabled: true,
                    failure_threshold: 3,
                    timeout_ms: 10_000,
                    ..CircuitBreakerSettings::default()
                },
                queue: QueueSettings {
                    max_queue_size: 200,
                    max_concurrent_batches: 5,
                    ..QueueSettings::default()
                },
                ..Self::default()
            },
            Preset::Development => Self {
                max_batch_size: 10,
                min_batch_size: 1,
                max_wait_time_ms: 500,
                default_strategy: StrategyKind::Hybrid,
                enable_deduplication: true,
                enable_coalescing: true,
                enable_adaptive_sizing: false,
                retry: RetrySettings {
                    max_retries: 1,
                    base_delay_ms: 100,
                    backoff_multiplier: 2.0,
                    max_delay_ms: 1000,
                },
                circuit_breaker: CircuitBreakerSettings {
                    enabled: false,
                    failure_threshold: 5,
                    timeout_ms: 5000,
                    ..CircuitBreakerSettings::default()
                },
                queue: QueueSettings {
                    max_queue_size: 100,
                    max_concurrent_batches: 2,
                    ..QueueSettings::default()
                },
                ..Self::default()
            },
        }
    }

    /// Preset by name; unknown names are a configuration error.
    pub fn preset_named(name: &str) -> Result<Self> {
        Ok(Self::preset(name.parse()?))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let cfg: Self = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `API_BATCHER_*` environment overrides:
    /// `MAX_BATCH_SIZE`, `MAX_WAIT_MS`, `STRATEGY`, `RPS`, `MAX_CONCURRENT`.
    pub fn with_env_overrides(mut self) -> Self {
        fn var<T: FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
        }
        if let Some(n) = var("API_BATCHER_MAX_BATCH_SIZE") {
            self.max_batch_size = n;
        }
        if let Some(ms) = var("API_BATCHER_MAX_WAIT_MS") {
            self.max_wait_time_ms = ms;
        }
        if let Some(kind) = var::<StrategyKind>("API_BATCHER_STRATEGY") {
            self.default_strategy = kind;
        }
        if let Some(rps) = var("API_BATCHER_RPS") {
            self.rate_limit_rps = Some(rps);
        }
        if let Some(n) = var("API_BATCHER_MAX_CONCURRENT") {
            self.queue.max_concurrent_batches = n;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new().with_field_path(field.to_string()),
            ))
        };
        if self.min_batch_size == 0 {
            return invalid("min_batch_size", "min_batch_size must be at least 1");
        }
        if self.max_batch_size == 0 {
            return invalid("max_batch_size", "max_batch_size must be at least 1");
        }
        if self.min_batch_size > self.max_batch_size {
            return invalid("min_batch_size", "min_batch_size exceeds max_batch_size");
        }
        if self.max_wait_time_ms == 0 {
            return invalid("max_wait_time_ms", "max_wait_time_ms must be positive");
        }
        if self.queue.max_queue_size == 0 {
            return invalid("queue.max_queue_size", "max_queue_size must be at least 1");
        }
        if self.queue.max_concurrent_batches == 0 {
            return invalid(
                "queue.max_concurrent_batches",
                "max_concurrent_batches must be at least 1",
            );
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier", "backoff_multiplier must be >= 1.0");
        }
        if let Some(rps) = self.rate_limit_rps {
            if !rps.is_finite() || rps < 0.0 {
                return invalid("rate_limit_rps", "rate_limit_rps must be a non-negative number");
            }
        }
        Ok(())
    }

    /// Copy with `max_batch_size` capped at the protocol limit.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.max_batch_size > MAX_PROTOCOL_BATCH_SIZE {
            warn!(
                requested = cfg.max_batch_size,
                limit = MAX_PROTOCOL_BATCH_SIZE,
                "max_batch_size capped at protocol limit"
            );
            cfg.max_batch_size = MAX_PROTOCOL_BATCH_SIZE;
        }
        cfg.min_batch_size = cfg.min_batch_size.min(cfg.max_batch_size);
        if cfg.persistent {
            warn!("persistent queue requested; batches are kept in memory only");
        }
        cfg
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig::new(self.min_batch_size, self.max_batch_size, self.max_wait_time())
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig::new()
            .with_deduplication(self.enable_deduplication)
            .with_coalescing(self.enable_coalescing)
            .with_adaptive_sizing(self.enable_adaptive_sizing)
            .with_priority_optimization(self.enable_priority_optimization)
            .with_zone_optimization(self.enable_zone_optimization)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.retry.max_retries)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_backoff_multiplier(self.retry.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(true)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_enabled(self.circuit_breaker.enabled)
            .with_failure_threshold(self.circuit_breaker.failure_threshold.max(1))
            .with_cooldown(Duration::from_millis(self.circuit_breaker.timeout_ms))
            .with_half_open_retry(Duration::from_millis(self.circuit_breaker.half_open_retry_ms))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .with_max_queue_size(self.queue.max_queue_size)
            .with_max_memory_bytes(self.queue.max_memory_mb.saturating_mul(1024 * 1024))
            .with_max_concurrent_batches(self.queue.max_concurrent_batches)
            .with_dequeue_strategy(self.queue.dequeue_strategy)
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
    }

    /// Throttle settings when `rate_limit_rps` is set to a positive rate.
    pub fn rate_limiter_config(&self) -> Option<RateLimiterConfig> {
        let cfg = self
            .rate_limit_rps
            .filter(|rps| *rps > 0.0)
            .and_then(RateLimiterConfig::from_rps)?;
        Some(match self.rate_limit_burst {
            Some(burst) => cfg.with_burst(burst),
            None => cfg,
        })
    }
}
