//! Dispatch: `CircuitBreaker(Retry(RateLimiter + processor))`, outcome recording, follow-up.

use super::core::ManagerInner;
use super::intake::Rejected;
use super::signals::ManagerCounters;
use crate::events::BatchEvent;
use crate::processor::BatchProcessor;
use crate::queue::QueueEntry;
use crate::result::{categorize_error, BatchResult, ErrorCategory, RequestError};
use crate::strategy::PerformanceSample;
use crate::types::{epoch_millis, Batch, BatchRequest};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A failed request awaiting its follow-up event.
#[derive(Debug, Clone)]
struct FollowUp {
    request_id: String,
    error: RequestError,
}

/// Ids a result entry stands for; coalesced requests expand to their sources.
fn source_ids(request: Option<&BatchRequest>, request_id: &str) -> Vec<String> {
    let sources = request
        .and_then(|r| r.metadata.get("coalesced_from"))
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if sources.is_empty() {
        vec![request_id.to_string()]
    } else {
        sources
    }
}

/// Batch processing time spread over the requests it carried.
fn per_request_ms(result: &BatchResult) -> f64 {
    result.metadata.processing_time_ms as f64 / result.results.len().max(1) as f64
}

impl ManagerInner {
    /// Claim an in-flight batch, queue it and wait for its dispatch to finish.
    pub(crate) async fn process_batch(self: &Arc<Self>, batch_id: &str) -> Result<Option<BatchResult>> {
        let claimed = self.lock_in_flight().claim(batch_id);
        let Some(mut entry) = claimed else {
            debug!(batch_id, "batch already dispatched");
            return Ok(None);
        };
        entry.cancel_timer();

        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(batch_id.to_string(), tx);
        if let Err(Rejected { error, batch }) = self.submit(entry.batch) {
            self.lock_waiters().remove(batch_id);
            warn!(batch_id, error = %error, "batch rejected by queue");
            let result = BatchResult::all_failed(&batch, RequestError::from(&error));
            self.record_outcome(&batch, &result);
            return Err(error);
        }

        match rx.await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Run one dequeued batch to completion and report back to the queue.
    pub(crate) async fn dispatch(self: Arc<Self>, entry: QueueEntry) {
        let wait = entry
            .last_attempt
            .map(|at| at.saturating_duration_since(entry.timestamp))
            .unwrap_or_default();
        self.metrics.record_wait_time(wait);
        let batch = entry.batch;
        debug!(batch_id = %batch.id, size = batch.len(), retry_count = entry.retry_count, "dispatching batch");

        let outcome = match self.processors.select(&batch) {
            Ok(processor) => self.execute(processor, &batch).await,
            Err(e) => Err(e),
        };
        let success = matches!(&outcome, Ok(result) if result.success);
        self.queue.complete(&batch.id, success);

        if let Err(Error::CircuitOpen { retry_in_ms, half_open }) = &outcome {
            if self
                .requeue_after_open_circuit(&batch.id, *retry_in_ms, *half_open)
                .await
            {
                self.wake.notify_one();
                return;
            }
        }

        self.finish(&batch, outcome);
        self.wake.notify_one();
    }

    /// Move a batch that hit an open circuit back to pending once the circuit may have cooled.
    ///
    /// A batch turned away while the half-open trial call runs never reached the backend, so its
    /// re-queue does not count against `retry.max_retries`.
    async fn requeue_after_open_circuit(
        &self,
        batch_id: &str,
        retry_in_ms: u64,
        half_open: bool,
    ) -> bool {
        let hint = Duration::from_millis(retry_in_ms);
        let pause = if half_open {
            hint
        } else {
            hint.min(self.retry.config().max_delay)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(pause) => {}
        }
        let requeued = if half_open {
            self.queue.requeue(batch_id)
        } else {
            self.queue.retry(batch_id, self.config.retry.max_retries)
        };
        match requeued {
            Ok(true) => {
                info!(batch_id, pause_ms = pause.as_millis() as u64, half_open, "circuit open, batch re-queued");
                true
            }
            Ok(false) => {
                warn!(batch_id, "circuit open and batch retries exhausted");
                false
            }
            Err(e) => {
                debug!(batch_id, error = %e, "batch could not be re-queued");
                false
            }
        }
    }

    /// Send a batch to its processor without going through the queue.
    pub(crate) fn dispatch_individually(self: &Arc<Self>, batch: Batch) -> Result<()> {
        let processor = self.processors.select(&batch)?;
        ManagerCounters::bump(&self.counters.individual_dispatches);
        let inner = self.clone();
        self.runtime.spawn(async move {
            let outcome = inner.execute(processor, &batch).await;
            inner.finish(&batch, outcome);
        });
        Ok(())
    }

    async fn execute(&self, processor: Arc<dyn BatchProcessor>, batch: &Batch) -> Result<BatchResult> {
        let limiter = &self.rate_limiter;
        let processor = &processor;
        self.breaker
            .call(|| {
                self.retry.run(|attempt| {
                    let processor = processor.clone();
                    async move {
                        limiter.acquire().await;
                        if attempt > 0 {
                            debug!(batch_id = %batch.id, attempt, processor = processor.name(), "re-dispatching batch");
                        }
                        let outcome = processor.process_batch(batch).await;
                        if let Err(Error::RateLimited { retry_after_ms, .. }) = &outcome {
                            warn!(batch_id = %batch.id, retry_after_ms, "backend rate limit, pausing dispatch");
                            limiter.block_for(Duration::from_millis(*retry_after_ms)).await;
                        }
                        outcome
                    }
                })
            })
            .await
    }

    /// Record the outcome and hand the result (or error) to whoever is waiting on it.
    fn finish(self: &Arc<Self>, batch: &Batch, outcome: Result<BatchResult>) {
        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err(e) => {
                warn!(batch_id = %batch.id, size = batch.len(), error = %e, "batch dispatch failed");
                (BatchResult::all_failed(batch, RequestError::from(&e)), Some(e))
            }
        };
        self.record_outcome(batch, &result);

        let waiter = self.lock_waiters().remove(&batch.id);
        if let Some(tx) = waiter {
            let reply = match error {
                Some(e) => Err(e),
                None => Ok(result),
            };
            // The caller may have stopped waiting.
            let _ = tx.send(reply);
        }
    }

    /// Feed metrics and the batch's strategy, then schedule follow-up for failed requests.
    pub(crate) fn record_outcome(self: &Arc<Self>, batch: &Batch, result: &BatchResult) {
        self.metrics.record_batch(result, &batch.endpoint);

        if let Some(strategy) = batch
            .metadata
            .strategy
            .as_deref()
            .and_then(|name| self.cached_strategy(name))
        {
            strategy.record_performance(PerformanceSample {
                timestamp: epoch_millis(),
                avg_response_time_ms: per_request_ms(result),
                success_rate: result.success_rate(),
                batch_size: result.results.len(),
                system_load: self.queue.stats().queue_utilization,
            });
        }

        info!(
            batch_id = %batch.id,
            size = result.results.len(),
            succeeded = result.success_count(),
            failed = result.failure_count(),
            processing_ms = result.metadata.processing_time_ms,
            "batch processed"
        );

        let failures: Vec<FollowUp> = result
            .failed()
            .flat_map(|r| {
                let error = r
                    .error
                    .clone()
                    .unwrap_or_else(|| RequestError::new("UnknownError", "request failed"));
                let request = batch.requests.iter().find(|q| q.id == r.request_id);
                source_ids(request, &r.request_id)
                    .into_iter()
                    .map(move |request_id| FollowUp {
                        request_id,
                        error: error.clone(),
                    })
            })
            .collect();
        if !failures.is_empty() {
            self.schedule_follow_up(batch.id.clone(), failures);
        }
    }

    /// After the follow-up delay, report each failed request as retryable or permanent.
    fn schedule_follow_up(&self, batch_id: String, failures: Vec<FollowUp>) {
        let delay_ms = self.config.follow_up_delay_ms;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        for _ in &failures {
            ManagerCounters::bump(&self.counters.follow_ups);
        }
        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            for FollowUp { request_id, error } in failures {
                let event = match categorize_error(&error.name, &error.message) {
                    ErrorCategory::Retryable => BatchEvent::RequestRetryScheduled {
                        request_id,
                        batch_id: batch_id.clone(),
                        delay_ms,
                        error: error.message,
                    },
                    ErrorCategory::Critical | ErrorCategory::Unknown => {
                        BatchEvent::RequestFailedPermanent {
                            request_id,
                            batch_id: batch_id.clone(),
                            error: error.message,
                        }
                    }
                };
                events.emit(event);
            }
        });
    }
}
