use super::config::{BatchManagerConfig, Preset};
use super::core::{BatchManager, InFlight, ManagerInner};
use super::scheduler;
use super::signals::ManagerCounters;
use crate::events::{EventBus, EventSink};
use crate::metrics::{AlertRule, MetricsCollector, MetricsConfig};
use crate::optimizer::BatchOptimizer;
use crate::processor::{BatchProcessor, ProcessorRegistry, ProcessorRoute};
use crate::queue::BatchQueue;
use crate::resilience::{CircuitBreaker, RateLimiter, RateLimiterConfig, RetryPolicy};
use crate::strategy::{StrategyConstructor, StrategyRegistry};
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builder for [`BatchManager`].
///
/// A default processor is mandatory; everything else has a default. `build` must run inside
/// a Tokio runtime because it starts the dispatch loop.
pub struct BatchManagerBuilder {
    config: BatchManagerConfig,
    default_processor: Option<Arc<dyn BatchProcessor>>,
    routes: Vec<(ProcessorRoute, Arc<dyn BatchProcessor>)>,
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: MetricsConfig,
    strategies: Vec<(String, StrategyConstructor)>,
}

impl Default for BatchManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: BatchManagerConfig::default(),
            default_processor: None,
            routes: Vec::new(),
            sinks: Vec::new(),
            metrics: MetricsConfig::default(),
            strategies: Vec::new(),
        }
    }

    pub fn config(mut self, config: BatchManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a named preset.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.config = BatchManagerConfig::preset(preset);
        self
    }

    /// Fallback processor used when no zone or endpoint route matches.
    pub fn default_processor(mut self, processor: Arc<dyn BatchProcessor>) -> Self {
        self.default_processor = Some(processor);
        self
    }

    pub fn zone_processor(mut self, zone: impl Into<String>, processor: Arc<dyn BatchProcessor>) -> Self {
        self.routes.push((ProcessorRoute::Zone(zone.into()), processor));
        self
    }

    pub fn endpoint_processor(
        mut self,
        endpoint: impl Into<String>,
        processor: Arc<dyn BatchProcessor>,
    ) -> Self {
        self.routes
            .push((ProcessorRoute::Endpoint(endpoint.into()), processor));
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replace the default alert rules.
    pub fn alert_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.metrics = self.metrics.with_alert_rules(rules);
        self
    }

    /// Register a custom strategy by name; it may then be used as `default_strategy`.
    pub fn strategy(mut self, name: impl Into<String>, ctor: StrategyConstructor) -> Self {
        self.strategies.push((name.into(), ctor));
        self
    }

    /// Throttle dispatches to `rps` per second.
    pub fn rate_limit_rps(mut self, rps: f64) -> Self {
        self.config.rate_limit_rps = Some(rps);
        self
    }

    pub fn build(self) -> Result<BatchManager> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "BatchManager must be built inside a Tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("batch_manager_builder"),
            )
        })?;
        self.config.validate()?;
        let config = self.config.normalized();
        let default_processor = self.default_processor.ok_or_else(|| {
            Error::configuration_with_context(
                "a default batch processor is required",
                ErrorContext::new().with_field_path("processor.default"),
            )
        })?;

        let strategies = StrategyRegistry::new();
        for (name, ctor) in self.strategies {
            strategies.register(name, ctor)?;
        }
        let default_strategy = config.default_strategy.as_str().to_string();

        let processors = ProcessorRegistry::new(default_processor);
        for (route, processor) in self.routes {
            processors.register(route, processor);
        }

        let events = Arc::new(EventBus::new());
        for sink in self.sinks {
            events.subscribe(sink);
        }

        let inner = Arc::new(ManagerInner {
            strategy_config: config.strategy_config(),
            metrics: MetricsCollector::new(self.metrics).with_events(events.clone()),
            optimizer: BatchOptimizer::new(config.optimizer_config()),
            queue: BatchQueue::new(config.queue_config(), events.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker_config()).with_events(events.clone()),
            retry: RetryPolicy::new(config.retry_config()),
            rate_limiter: RateLimiter::new(
                config
                    .rate_limiter_config()
                    .unwrap_or_else(RateLimiterConfig::unlimited),
            ),
            processors,
            strategies,
            strategy_cache: Mutex::new(HashMap::new()),
            default_strategy: ArcSwap::from_pointee(default_strategy),
            in_flight: Mutex::new(InFlight::default()),
            waiters: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
            counters: ManagerCounters::default(),
            runtime,
            events,
            config,
        });

        let handle = scheduler::spawn(&inner);
        *inner
            .scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        info!(
            default_strategy = %inner.default_strategy.load(),
            max_batch_size = inner.config.max_batch_size,
            max_wait_time_ms = inner.config.max_wait_time_ms,
            max_concurrent_batches = inner.config.queue.max_concurrent_batches,
            "batch manager started"
        );
        Ok(BatchManager { inner })
    }
}
