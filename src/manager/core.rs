use super::config::BatchManagerConfig;
use super::signals::{ManagerCounters, ManagerMetrics};
use crate::events::{BatchEvent, EventBus, EventSink};
use crate::health::{HealthReport, HealthStatus};
use crate::metrics::MetricsCollector;
use crate::optimizer::BatchOptimizer;
use crate::processor::{BatchProcessor, ProcessorRegistry, ProcessorRoute};
use crate::queue::BatchQueue;
use crate::resilience::{CircuitBreaker, CircuitState, RateLimiter, RetryPolicy};
use crate::result::{BatchResult, RequestError};
use crate::strategy::{BatchStrategy, StrategyConfig, StrategyConstructor, StrategyRegistry};
use crate::types::{Batch, BatchRequest};
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error rate above which the manager reports itself critical.
const CRITICAL_ERROR_RATE: f64 = 0.5;
/// Error rate above which the manager reports itself degraded.
const DEGRADED_ERROR_RATE: f64 = 0.1;

/// What happened to a request handed to [`BatchManager::add_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The request joined a batch that is still collecting.
    Collecting { batch_id: String },
    /// The request tripped its batch's trigger; the batch is queued for dispatch.
    Dispatched { batch_id: String },
    /// The queue refused the batch; it was sent straight to a processor instead.
    ProcessedIndividually { batch_id: String, reason: String },
}

impl AddOutcome {
    pub fn batch_id(&self) -> &str {
        match self {
            AddOutcome::Collecting { batch_id }
            | AddOutcome::Dispatched { batch_id }
            | AddOutcome::ProcessedIndividually { batch_id, .. } => batch_id,
        }
    }
}

pub(crate) struct InFlightBatch {
    pub(crate) batch: Batch,
    pub(crate) strategy: Arc<dyn BatchStrategy>,
    pub(crate) key: String,
    pub(crate) timer: Option<JoinHandle<()>>,
}

/// Batches still collecting requests. Removing an id from `batches` is the dispatch claim.
#[derive(Default)]
pub(crate) struct InFlight {
    pub(crate) batches: HashMap<String, InFlightBatch>,
    pub(crate) by_key: HashMap<String, Vec<String>>,
}

impl InFlight {
    /// Take a batch out of the collecting set. The caller decides what happens to its timer.
    pub(crate) fn claim(&mut self, batch_id: &str) -> Option<InFlightBatch> {
        let entry = self.batches.remove(batch_id)?;
        if let Some(ids) = self.by_key.get_mut(&entry.key) {
            ids.retain(|id| id != batch_id);
            if ids.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
        Some(entry)
    }
}

pub(crate) type Waiter = oneshot::Sender<Result<BatchResult>>;

/// State shared by the public handle, the scheduler loop, batch timers and dispatch tasks.
pub(crate) struct ManagerInner {
    pub(crate) config: BatchManagerConfig,
    pub(crate) strategy_config: StrategyConfig,
    pub(crate) events: Arc<EventBus>,
    pub(crate) metrics: MetricsCollector,
    pub(crate) optimizer: BatchOptimizer,
    pub(crate) queue: BatchQueue,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) retry: RetryPolicy,
    /// Always present; without `rate_limit_rps` it only enforces backend rate-limit windows.
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) processors: ProcessorRegistry,
    pub(crate) strategies: StrategyRegistry,
    pub(crate) strategy_cache: Mutex<HashMap<String, Arc<dyn BatchStrategy>>>,
    pub(crate) default_strategy: ArcSwap<String>,
    pub(crate) in_flight: Mutex<InFlight>,
    pub(crate) waiters: Mutex<HashMap<String, Waiter>>,
    pub(crate) accepting: AtomicBool,
    pub(crate) wake: Notify,
    pub(crate) cancel: CancellationToken,
    pub(crate) scheduler: Mutex<Option<JoinHandle<()>>>,
    pub(crate) counters: ManagerCounters,
    /// Runtime captured at build time; timers and dispatch tasks are spawned on it.
    pub(crate) runtime: tokio::runtime::Handle,
}

impl ManagerInner {
    pub(crate) fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared instance per strategy name, so adaptive history survives across batches.
    pub(crate) fn strategy(&self, name: &str) -> Result<Arc<dyn BatchStrategy>> {
        let mut cache = self
            .strategy_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = cache.get(name) {
            return Ok(s.clone());
        }
        let s = self.strategies.create(name, &self.strategy_config)?;
        cache.insert(name.to_string(), s.clone());
        Ok(s)
    }

    pub(crate) fn cached_strategy(&self, name: &str) -> Option<Arc<dyn BatchStrategy>> {
        self.strategy_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// Orchestrates intake, triggering, optimization, queueing and dispatch of request batches.
///
/// Cloning is cheap; all clones drive the same pipeline. Build one with
/// [`BatchManager::builder`] inside a Tokio runtime.
#[derive(Clone)]
pub struct BatchManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl BatchManager {
    pub fn builder() -> super::BatchManagerBuilder {
        super::BatchManagerBuilder::new()
    }

    /// Manager with `config` and a single default processor.
    pub fn new(config: BatchManagerConfig, processor: Arc<dyn BatchProcessor>) -> Result<Self> {
        Self::builder()
            .config(config)
            .default_processor(processor)
            .build()
    }

    pub fn config(&self) -> &BatchManagerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.inner.events.subscribe(sink);
    }

    /// Admit a request into a compatible in-flight batch, opening one if needed.
    ///
    /// Returns without waiting for the network call. Fails fast with [`Error::Shutdown`]
    /// once shutdown has begun.
    pub fn add_request(&self, request: BatchRequest) -> Result<AddOutcome> {
        self.inner.add_request(request)
    }

    /// Dispatch an in-flight batch now and wait for its result.
    ///
    /// Returns `Ok(None)` when the id is not in flight, e.g. because its timer or a
    /// size trigger already dispatched it.
    pub async fn process_batch(&self, batch_id: &str) -> Result<Option<BatchResult>> {
        self.inner.process_batch(batch_id).await
    }

    /// Switch the strategy used for batches without a more specific match.
    pub fn set_default_strategy(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        if !inner.strategies.contains(name) {
            return Err(Error::configuration_with_context(
                format!("unknown batch strategy '{}'", name),
                ErrorContext::new().with_field_path("default_strategy"),
            ));
        }
        let previous = inner.default_strategy.swap(Arc::new(name.to_string()));
        if previous.as_str() != name {
            info!(from = %previous, to = name, "default strategy changed");
            inner.events.emit(BatchEvent::StrategyChanged {
                from: previous.to_string(),
                to: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn default_strategy(&self) -> String {
        self.inner.default_strategy.load().to_string()
    }

    pub fn register_strategy(&self, name: impl Into<String>, ctor: StrategyConstructor) -> Result<()> {
        self.inner.strategies.register(name, ctor)
    }

    pub fn register_processor(&self, route: ProcessorRoute, processor: Arc<dyn BatchProcessor>) {
        self.inner.processors.register(route, processor);
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock_in_flight().batches.len()
    }

    pub fn in_flight_batch_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_in_flight().batches.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn queue(&self) -> &BatchQueue {
        &self.inner.queue
    }

    pub fn metrics_collector(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.is_accepting()
    }

    /// Point-in-time view of metrics, queue, breaker and throttle.
    pub async fn metrics(&self) -> ManagerMetrics {
        let inner = &self.inner;
        let throttle = inner.rate_limiter.snapshot().await;
        let rate_limiter = if throttle.rps > 0.0 || throttle.estimated_wait_ms.is_some() {
            Some(throttle)
        } else {
            None
        };
        let (in_flight_batches, in_flight_requests) = {
            let f = inner.lock_in_flight();
            (
                f.batches.len(),
                f.batches.values().map(|b| b.batch.len()).sum(),
            )
        };
        ManagerMetrics {
            metrics: inner.metrics.snapshot(),
            queue: inner.queue.stats(),
            circuit_breaker: inner.breaker.snapshot(),
            rate_limiter,
            default_strategy: self.default_strategy(),
            in_flight_batches,
            in_flight_requests,
            dispatch_retries: inner.retry.total_retries(),
            counters: inner.counters.snapshot(),
        }
    }

    /// Worst of queue, circuit breaker, error rate and processor health.
    pub async fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let mut report = inner.queue.stats().health();

        match inner.breaker.state() {
            CircuitState::Open => report.flag(HealthStatus::Critical, "circuit breaker open"),
            CircuitState::HalfOpen => report.flag(HealthStatus::Degraded, "circuit breaker half-open"),
            CircuitState::Closed => {}
        }

        let snapshot = inner.metrics.snapshot();
        if snapshot.total_requests > 0 {
            if snapshot.error_rate > CRITICAL_ERROR_RATE {
                report.flag(
                    HealthStatus::Critical,
                    format!("error rate {:.0}%", snapshot.error_rate * 100.0),
                );
            } else if snapshot.error_rate > DEGRADED_ERROR_RATE {
                report.flag(
                    HealthStatus::Degraded,
                    format!("error rate {:.0}%", snapshot.error_rate * 100.0),
                );
            }
        }

        if !inner.is_accepting() {
            report.flag(HealthStatus::Degraded, "shutting down");
        }

        report.merge(inner.processors.health().await);
        report
    }

    /// Hold every dispatch for `window`, e.g. after the backend announced a rate-limit window
    /// out of band. Processors can do the same by returning [`Error::RateLimited`].
    pub async fn throttle_for(&self, window: std::time::Duration) {
        info!(window_ms = window.as_millis() as u64, "dispatch paused");
        self.inner.rate_limiter.block_for(window).await;
    }

    /// Stop admission and drain in-flight batches within the shutdown deadline.
    ///
    /// Returns `true` when everything drained in time. Calling it again is a no-op.
    pub async fn shutdown(&self) -> bool {
        self.inner.shutdown().await
    }
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("default_strategy", &self.default_strategy())
            .field("in_flight", &self.in_flight_len())
            .field("queue", &self.inner.queue)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl ManagerInner {
    pub(crate) async fn shutdown(self: &Arc<Self>) -> bool {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return true;
        }
        let timeout = std::time::Duration::from_millis(self.config.shutdown_timeout_ms);
        let deadline = tokio::time::Instant::now() + timeout;
        info!(timeout_ms = self.config.shutdown_timeout_ms, "batch manager shutting down");

        let mut drained = true;
        loop {
            let ids: Vec<String> = self.lock_in_flight().batches.keys().cloned().collect();
            if ids.is_empty() {
                break;
            }
            let drains = ids.iter().map(|id| self.process_batch(id));
            match tokio::time::timeout_at(deadline, futures::future::join_all(drains)).await {
                Ok(results) => {
                    for err in results.into_iter().filter_map(|r| r.err()) {
                        warn!(error = %err, "batch failed during shutdown drain");
                    }
                }
                Err(_) => {
                    drained = false;
                    break;
                }
            }
        }

        let abandoned = {
            let mut f = self.lock_in_flight();
            let ids: Vec<String> = f.batches.keys().cloned().collect();
            for id in &ids {
                if let Some(mut entry) = f.claim(id) {
                    entry.cancel_timer();
                }
            }
            ids.len()
        };
        if abandoned > 0 {
            warn!(abandoned, "shutdown deadline reached, dropping in-flight batches");
        }

        // Batches the queue already accepted still go out while the scheduler runs.
        if drained {
            drained = self.drain_queue(deadline).await;
        }
        self.fail_pending_at_shutdown();

        drained &= self.queue.shutdown().await;
        self.cancel.cancel();
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "scheduler task ended abnormally");
                }
            }
        }
        // Remaining receivers observe the dropped sender as a shutdown.
        self.lock_waiters().clear();
        info!(drained, "batch manager stopped");
        drained
    }

    /// Keep the scheduler dispatching until the queue is empty or `deadline` passes.
    async fn drain_queue(&self, deadline: tokio::time::Instant) -> bool {
        let poll = std::time::Duration::from_millis(self.config.scheduler_poll_interval_ms.clamp(1, 50));
        loop {
            let (pending, processing) = (self.queue.pending_len(), self.queue.processing_len());
            if pending + processing == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, processing, "shutdown deadline reached with queued batches");
                return false;
            }
            self.wake.notify_one();
            tokio::time::sleep(poll).await;
        }
    }

    /// Pending batches left after the deadline are reported failed instead of vanishing.
    fn fail_pending_at_shutdown(self: &Arc<Self>) {
        let ids = self.queue.pending_ids();
        for id in ids {
            if let Some(batch) = self.queue.remove(&id) {
                let result = BatchResult::all_failed(&batch, RequestError::from(&Error::Shutdown));
                self.record_outcome(&batch, &result);
                if let Some(tx) = self.lock_waiters().remove(&id) {
                    let _ = tx.send(Err(Error::Shutdown));
                }
            }
        }
    }
}
