//! Request intake: compatibility matching, strategy choice, batch timers, submission.

use super::core::{AddOutcome, InFlightBatch, ManagerInner};
use super::signals::ManagerCounters;
use crate::events::BatchEvent;
use crate::optimizer::OptimizedBatch;
use crate::strategy::{StrategyContext, StrategyKind};
use crate::types::{Batch, BatchRequest, BatchStatus};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hinted batch size at or below which the time-based strategy is used.
const SMALL_BATCH_HINT: usize = 10;
/// Hinted batch size at or above which the size-based strategy is used.
const LARGE_BATCH_HINT: usize = 50;
/// Priority at or above which the priority-aware strategy is used.
const PRIORITY_AWARE_FROM: u8 = 8;
/// Largest priority gap allowed inside one batch.
const MAX_PRIORITY_GAP: u8 = 2;

/// A batch the queue refused, handed back with the reason.
pub(crate) struct Rejected {
    pub(crate) error: Error,
    pub(crate) batch: Batch,
}

/// Whether `request` may join `batch`.
pub(crate) fn is_compatible(batch: &Batch, request: &BatchRequest) -> bool {
    if batch.zone != request.zone
        || batch.endpoint != request.endpoint
        || batch.method != request.method
        || batch.is_full()
    {
        return false;
    }
    if batch.priority.abs_diff(request.priority) > MAX_PRIORITY_GAP {
        return false;
    }
    match request.hints.as_ref().and_then(|h| h.max_delay_ms) {
        Some(max_delay) => batch.age() < Duration::from_millis(max_delay),
        None => true,
    }
}

fn validate_request(request: &BatchRequest) -> Result<()> {
    let field = if request.id.trim().is_empty() {
        Some("request.id")
    } else if request.endpoint.trim().is_empty() {
        Some("request.endpoint")
    } else {
        None
    };
    match field {
        Some(path) => Err(Error::validation_with_context(
            format!("{} must not be empty", path),
            ErrorContext::new().with_field_path(path),
        )),
        None => Ok(()),
    }
}

impl ManagerInner {
    pub(crate) fn add_request(self: &Arc<Self>, request: BatchRequest) -> Result<AddOutcome> {
        if !self.is_accepting() {
            return Err(Error::Shutdown);
        }
        validate_request(&request)?;
        ManagerCounters::bump(&self.counters.requests_received);
        self.admit(request)
    }

    /// Strategy for a batch opened by `request`.
    pub(crate) fn select_strategy_name(&self, request: &BatchRequest) -> String {
        let hinted = request.hints.as_ref().and_then(|h| h.preferred_batch_size);
        match hinted {
            Some(size) if size <= SMALL_BATCH_HINT => StrategyKind::TimeBased.as_str().to_string(),
            Some(size) if size >= LARGE_BATCH_HINT => StrategyKind::SizeBased.as_str().to_string(),
            _ if request.priority >= PRIORITY_AWARE_FROM => {
                StrategyKind::PriorityAware.as_str().to_string()
            }
            _ => self.default_strategy.load().to_string(),
        }
    }

    fn context_for(&self, request: &BatchRequest) -> StrategyContext {
        let stats = self.queue.stats();
        let collecting = self.lock_in_flight().batches.len();
        StrategyContext::new(request.zone.clone(), request.endpoint.clone())
            .with_system_load(stats.queue_utilization)
            .with_queue_depth(stats.pending)
            .with_active_batches(collecting + stats.processing)
            .with_recent_performance(self.metrics.recent_performance())
    }

    /// Place a request into an in-flight batch and fire the batch if its strategy says so.
    /// Shutdown is not checked here so that requests cut by the optimizer can re-enter.
    pub(crate) fn admit(self: &Arc<Self>, request: BatchRequest) -> Result<AddOutcome> {
        let strategy_name = self.select_strategy_name(&request);
        let strategy = match self.strategy(&strategy_name) {
            Ok(s) => s,
            Err(e) => {
                warn!(request_id = %request.id, strategy = %strategy_name, error = %e, "no usable strategy, dispatching request alone");
                let mut single = Batch::for_request(&request, 1, self.strategy_config.max_wait_time);
                single.push(request);
                return self.fall_back(single, e);
            }
        };
        let ctx = self.context_for(&request);
        let key = request.batch_key();

        let mut created = None;
        let (batch_id, claimed) = {
            let mut f = self.lock_in_flight();
            let existing = f.by_key.get(&key).and_then(|ids| {
                ids.iter()
                    .find(|id| {
                        f.batches
                            .get(id.as_str())
                            .is_some_and(|e| is_compatible(&e.batch, &request))
                    })
                    .cloned()
            });
            let batch_id = match existing {
                Some(id) => id,
                None => {
                    let size = strategy.optimal_batch_size(&ctx);
                    let timeout = strategy.batch_timeout(&ctx);
                    let mut batch = Batch::for_request(&request, size, timeout);
                    batch.metadata.strategy = Some(strategy_name.clone());
                    let id = batch.id.clone();
                    created = Some(BatchEvent::BatchCreated {
                        batch_id: id.clone(),
                        key: key.clone(),
                        strategy: strategy_name.clone(),
                        max_size: batch.max_size,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                    let timer = self.spawn_timer(&id, timeout);
                    f.by_key.entry(key.clone()).or_default().push(id.clone());
                    f.batches.insert(
                        id.clone(),
                        InFlightBatch {
                            batch,
                            strategy: strategy.clone(),
                            key: key.clone(),
                            timer: Some(timer),
                        },
                    );
                    id
                }
            };
            let Some(entry) = f.batches.get_mut(&batch_id) else {
                return Err(Error::runtime_with_context(
                    "in-flight batch disappeared during intake",
                    ErrorContext::new()
                        .with_details(format!("batch_id={}", batch_id))
                        .with_source("batch_manager"),
                ));
            };
            entry.batch.push(request);
            let fire = entry.strategy.should_process(&entry.batch);
            let claimed = if fire { f.claim(&batch_id) } else { None };
            (batch_id, claimed)
        };

        if let Some(event) = created {
            ManagerCounters::bump(&self.counters.batches_created);
            debug!(batch_id = %batch_id, key = %key, strategy = %strategy_name, "batch opened");
            self.events.emit(event);
        }

        match claimed {
            Some(mut entry) => {
                entry.cancel_timer();
                debug!(batch_id = %batch_id, size = entry.batch.len(), "batch trigger fired");
                self.submit_or_fall_back(entry.batch)
            }
            None => Ok(AddOutcome::Collecting { batch_id }),
        }
    }

    /// Auto-fire deadline for an in-flight batch.
    fn spawn_timer(self: &Arc<Self>, batch_id: &str, timeout: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let batch_id = batch_id.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // The timer is the claimant here, so it must not abort itself.
            let claimed = inner.lock_in_flight().claim(&batch_id);
            if let Some(entry) = claimed {
                debug!(batch_id = %batch_id, timeout_ms = timeout.as_millis() as u64, "batch timeout reached");
                if let Err(e) = inner.submit_or_fall_back(entry.batch) {
                    warn!(batch_id = %batch_id, error = %e, "timed-out batch could not be dispatched");
                }
            }
        })
    }

    /// Optimize and enqueue a claimed batch. Requests cut by adaptive sizing are admitted again.
    pub(crate) fn submit(self: &Arc<Self>, batch: Batch) -> std::result::Result<String, Rejected> {
        let original_size = batch.len();
        let OptimizedBatch { mut batch, deferred } = self.optimizer.optimize(batch);
        self.metrics.record_optimization(original_size);
        batch.status = BatchStatus::Ready;
        let batch_id = batch.id.clone();
        let size = batch.len();
        let enqueued = self.queue.enqueue(batch.clone());
        self.readmit(deferred);
        match enqueued {
            Ok(()) => {
                ManagerCounters::bump(&self.counters.batches_submitted);
                info!(batch_id = %batch_id, size, original_size, "batch queued for dispatch");
                self.wake.notify_one();
                Ok(batch_id)
            }
            Err(error) => Err(Rejected { error, batch }),
        }
    }

    fn submit_or_fall_back(self: &Arc<Self>, batch: Batch) -> Result<AddOutcome> {
        match self.submit(batch) {
            Ok(batch_id) => Ok(AddOutcome::Dispatched { batch_id }),
            Err(Rejected { error, batch }) => self.fall_back(batch, error),
        }
    }

    /// Send a batch straight to its processor, bypassing the queue.
    fn fall_back(self: &Arc<Self>, batch: Batch, reason: Error) -> Result<AddOutcome> {
        warn!(batch_id = %batch.id, size = batch.len(), reason = %reason, "falling back to individual dispatch");
        let batch_id = batch.id.clone();
        self.dispatch_individually(batch)?;
        Ok(AddOutcome::ProcessedIndividually {
            batch_id,
            reason: reason.to_string(),
        })
    }

    fn readmit(self: &Arc<Self>, deferred: Vec<BatchRequest>) {
        if deferred.is_empty() {
            return;
        }
        debug!(count = deferred.len(), "re-admitting requests deferred by adaptive sizing");
        for request in deferred {
            ManagerCounters::bump(&self.counters.requests_readmitted);
            let request_id = request.id.clone();
            if let Err(e) = self.admit(request) {
                warn!(request_id = %request_id, error = %e, "deferred request could not be re-admitted");
            }
        }
    }
}

impl InFlightBatch {
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
