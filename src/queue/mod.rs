//! 批次队列模块：带优先级/分区/端点索引的准入控制与并发调度。
//!
//! # Batch Queue
//!
//! Holding area between the optimizer and dispatch. A batch id lives in exactly one of three
//! maps at a time; moving between them is the only way an entry changes state:
//!
//! ```text
//! enqueue ──> pending ──dequeue──> processing ──complete──> completed
//!                ^                                             │
//!                └──────────────── retry (failed only) ────────┘
//! ```
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchQueue`] | Admission control, indexed pending set, bounded processing slots |
//! | [`QueueConfig`] | Limits, dequeue order and shutdown timing |
//! | [`DequeueStrategy`] | `priority`, `fifo`, `round-robin`, `least-load` |
//! | [`QueueStats`] | Counters, utilization and the health verdict |

mod stats;

pub use stats::{QueueStats, CRITICAL_UTILIZATION, DEGRADED_UTILIZATION};

use crate::events::{BatchEvent, EventBus};
use crate::types::{Batch, BatchStatus};
use crate::{AdmissionKind, Error, ErrorContext, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Order in which pending batches are handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DequeueStrategy {
    /// Highest priority first, oldest within a priority.
    #[default]
    Priority,
    /// Globally oldest first.
    Fifo,
    /// Random starting zone, first zone with pending work.
    RoundRobin,
    /// Zone with the fewest batches in flight.
    LeastLoad,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_memory_bytes: usize,
    pub max_concurrent_batches: usize,
    pub dequeue_strategy: DequeueStrategy,
    /// Pending utilization at which `queue.warning` is emitted.
    pub warning_threshold: f64,
    /// Flat per-entry memory estimate.
    pub bytes_per_batch: usize,
    /// Completed entries retained for retry and inspection.
    pub completed_retention: usize,
    pub shutdown_poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_memory_bytes: 100 * 1024 * 1024,
            max_concurrent_batches: 10,
            dequeue_strategy: DequeueStrategy::Priority,
            warning_threshold: 0.8,
            bytes_per_batch: 1000,
            completed_retention: 1000,
            shutdown_poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }
    pub fn with_max_memory_bytes(mut self, n: usize) -> Self {
        self.max_memory_bytes = n;
        self
    }
    pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
        self.max_concurrent_batches = n;
        self
    }
    pub fn with_dequeue_strategy(mut self, s: DequeueStrategy) -> Self {
        self.dequeue_strategy = s;
        self
    }
    pub fn with_shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }
}

/// A batch plus its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub batch: Batch,
    /// Enqueue time; refreshed on retry.
    pub timestamp: Instant,
    /// Priority captured at enqueue.
    pub priority: u8,
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
    pub completed_at: Option<Instant>,
    /// Outcome once completed.
    pub succeeded: Option<bool>,
    seq: u64,
}

impl QueueEntry {
    fn order_key(&self) -> (Instant, u64) {
        (self.timestamp, self.seq)
    }
}

/// Which map currently owns a batch id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Default)]
struct Counters {
    total_enqueued: u64,
    total_processed: u64,
    total_failed: u64,
    total_retried: u64,
    average_processing_time_ms: f64,
    average_wait_time_ms: f64,
    processing_seeded: bool,
    wait_seeded: bool,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<String, QueueEntry>,
    processing: HashMap<String, QueueEntry>,
    completed: HashMap<String, QueueEntry>,
    by_priority: BTreeMap<u8, HashSet<String>>,
    by_zone: BTreeMap<String, HashSet<String>>,
    by_endpoint: BTreeMap<String, HashSet<String>>,
    counters: Counters,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn entry_count(&self) -> usize {
        self.pending.len() + self.processing.len() + self.completed.len()
    }

    fn index(&mut self, entry: &QueueEntry) {
        let id = entry.batch.id.clone();
        self.by_priority
            .entry(entry.priority)
            .or_default()
            .insert(id.clone());
        self.by_zone
            .entry(entry.batch.zone.clone())
            .or_default()
            .insert(id.clone());
        self.by_endpoint
            .entry(entry.batch.endpoint.clone())
            .or_default()
            .insert(id);
    }

    fn unindex(&mut self, entry: &QueueEntry) {
        let id = &entry.batch.id;
        remove_from(&mut self.by_priority, &entry.priority, id);
        remove_from(&mut self.by_zone, &entry.batch.zone, id);
        remove_from(&mut self.by_endpoint, &entry.batch.endpoint, id);
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn oldest_of<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Option<String> {
        ids.filter_map(|id| self.pending.get(id))
            .min_by_key(|e| e.order_key())
            .map(|e| e.batch.id.clone())
    }

    fn select(&self, strategy: DequeueStrategy) -> Option<String> {
        match strategy {
            DequeueStrategy::Priority => self
                .by_priority
                .iter()
                .rev()
                .find(|(_, ids)| !ids.is_empty())
                .and_then(|(_, ids)| self.oldest_of(ids.iter())),
            DequeueStrategy::Fifo => self.oldest_of(self.pending.keys()),
            DequeueStrategy::RoundRobin => {
                let zones: Vec<&HashSet<String>> =
                    self.by_zone.values().filter(|ids| !ids.is_empty()).collect();
                if zones.is_empty() {
                    return None;
                }
                let start = rand::thread_rng().gen_range(0..zones.len());
                (0..zones.len())
                    .map(|i| zones[(start + i) % zones.len()])
                    .find_map(|ids| self.oldest_of(ids.iter()))
            }
            DequeueStrategy::LeastLoad => {
                let mut load: HashMap<&str, usize> = HashMap::new();
                for e in self.processing.values() {
                    *load.entry(e.batch.zone.as_str()).or_insert(0) += 1;
                }
                self.by_zone
                    .iter()
                    .filter(|(_, ids)| !ids.is_empty())
                    .min_by_key(|(zone, _)| load.get(zone.as_str()).copied().unwrap_or(0))
                    .and_then(|(_, ids)| self.oldest_of(ids.iter()))
            }
        }
    }

    fn prune_completed(&mut self, keep: usize) {
        if self.completed.len() <= keep {
            return;
        }
        let mut by_age: Vec<(Instant, String)> = self
            .completed
            .values()
            .map(|e| (e.completed_at.unwrap_or(e.timestamp), e.batch.id.clone()))
            .collect();
        by_age.sort();
        let excess = self.completed.len() - keep;
        for (_, id) in by_age.into_iter().take(excess) {
            self.completed.remove(&id);
        }
    }
}

fn remove_from<K: Ord>(map: &mut BTreeMap<K, HashSet<String>>, key: &K, id: &str) {
    let now_empty = match map.get_mut(key) {
        Some(ids) => {
            ids.remove(id);
            ids.is_empty()
        }
        None => false,
    };
    if now_empty {
        map.remove(key);
    }
}

fn smooth(avg: &mut f64, seeded: &mut bool, sample: f64) {
    *avg = if *seeded {
        0.1 * sample + 0.9 * *avg
    } else {
        sample
    };
    *seeded = true;
}

/// Priority/zone/endpoint indexed batch queue with bounded processing slots.
///
/// All methods are synchronous and take a short internal lock; stats readers run
/// concurrently with each other. Events are emitted after the lock is released.
pub struct BatchQueue {
    config: QueueConfig,
    state: RwLock<State>,
    events: Arc<EventBus>,
}

impl BatchQueue {
    pub fn new(config: QueueConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<BatchEvent>) {
        for e in events {
            self.events.emit(e);
        }
    }

    fn utilization(&self, pending: usize) -> f64 {
        if self.config.max_queue_size == 0 {
            1.0
        } else {
            pending as f64 / self.config.max_queue_size as f64
        }
    }

    /// Admit a batch into the pending set.
    pub fn enqueue(&self, mut batch: Batch) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let mut st = self.write();
            let pending = st.pending.len();
            let memory = st.entry_count() * self.config.bytes_per_batch;
            if st.closed {
                Err(Error::Shutdown)
            } else if pending >= self.config.max_queue_size {
                events.push(BatchEvent::QueueFull {
                    pending,
                    max_queue_size: self.config.max_queue_size,
                });
                Err(Error::admission(
                    AdmissionKind::QueueFull,
                    "pending queue at capacity",
                    ErrorContext::new()
                        .with_details(format!("pending={} max={}", pending, self.config.max_queue_size))
                        .with_source("batch_queue"),
                ))
            } else if memory >= self.config.max_memory_bytes {
                Err(Error::admission(
                    AdmissionKind::MemoryLimit,
                    "estimated queue memory at limit",
                    ErrorContext::new()
                        .with_details(format!("estimated={}B limit={}B", memory, self.config.max_memory_bytes))
                        .with_source("batch_queue"),
                ))
            } else if st.pending.contains_key(&batch.id)
                || st.processing.contains_key(&batch.id)
                || st.completed.contains_key(&batch.id)
            {
                Err(Error::validation_with_context(
                    format!("batch {} is already queued", batch.id),
                    ErrorContext::new().with_field_path("batch.id"),
                ))
            } else {
                batch.status = BatchStatus::Ready;
                let seq = st.take_seq();
                let entry = QueueEntry {
                    priority: batch.priority,
                    timestamp: Instant::now(),
                    retry_count: 0,
                    last_attempt: None,
                    completed_at: None,
                    succeeded: None,
                    seq,
                    batch,
                };
                st.index(&entry);
                let id = entry.batch.id.clone();
                events.push(BatchEvent::BatchEnqueued {
                    batch_id: id.clone(),
                    priority: entry.priority,
                    size: entry.batch.len(),
                    pending: pending + 1,
                });
                st.pending.insert(id, entry);
                st.counters.total_enqueued += 1;

                let before = self.utilization(pending);
                let after = self.utilization(pending + 1);
                if before < self.config.warning_threshold && after >= self.config.warning_threshold {
                    events.push(BatchEvent::QueueWarning {
                        utilization: after,
                        threshold: self.config.warning_threshold,
                    });
                }
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "batch rejected by queue");
        }
        self.emit_all(events);
        result
    }

    /// Hand out one pending batch, or `None` when empty or every slot is busy.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        let (entry, wait) = {
            let mut st = self.write();
            if st.pending.is_empty() || st.processing.len() >= self.config.max_concurrent_batches {
                return None;
            }
            let id = st.select(self.config.dequeue_strategy)?;
            let mut entry = st.pending.remove(&id)?;
            st.unindex(&entry);
            let now = Instant::now();
            let wait = now.duration_since(entry.timestamp);
            let c = &mut st.counters;
            smooth(
                &mut c.average_wait_time_ms,
                &mut c.wait_seeded,
                wait.as_millis() as f64,
            );
            entry.last_attempt = Some(now);
            entry.batch.status = BatchStatus::Processing;
            st.processing.insert(id, entry.clone());
            (entry, wait)
        };
        debug!(batch_id = %entry.batch.id, wait_ms = wait.as_millis() as u64, "batch dequeued");
        self.events.emit(BatchEvent::BatchDequeued {
            batch_id: entry.batch.id.clone(),
            wait_ms: wait.as_millis() as u64,
        });
        Some(entry)
    }

    /// Move a processing batch to completed. Returns `false` for unknown ids.
    pub fn complete(&self, batch_id: &str, success: bool) -> bool {
        let processing_ms = {
            let mut st = self.write();
            let Some(mut entry) = st.processing.remove(batch_id) else {
                return false;
            };
            let now = Instant::now();
            let started = entry.last_attempt.unwrap_or(entry.timestamp);
            let processing_ms = now.duration_since(started).as_millis() as u64;
            entry.completed_at = Some(now);
            entry.succeeded = Some(success);
            entry.batch.status = if success {
                BatchStatus::Completed
            } else {
                BatchStatus::Failed
            };
            let c = &mut st.counters;
            if success {
                c.total_processed += 1;
            } else {
                c.total_failed += 1;
            }
            smooth(
                &mut c.average_processing_time_ms,
                &mut c.processing_seeded,
                processing_ms as f64,
            );
            st.completed.insert(batch_id.to_string(), entry);
            st.prune_completed(self.config.completed_retention);
            processing_ms
        };
        let event = if success {
            BatchEvent::BatchCompleted {
                batch_id: batch_id.to_string(),
                processing_ms,
            }
        } else {
            BatchEvent::BatchFailed {
                batch_id: batch_id.to_string(),
                reason: "processing failed".to_string(),
            }
        };
        self.events.emit(event);
        true
    }

    /// Send a failed batch back to pending.
    ///
    /// Returns `Ok(false)` once the batch has used up `max_retries`; errors when the id is
    /// not a failed, completed batch.
    pub fn retry(&self, batch_id: &str, max_retries: u32) -> Result<bool> {
        self.send_back(batch_id, Some(max_retries))
    }

    /// Send a failed batch back to pending without spending one of its retries.
    ///
    /// For batches that never reached a processor, e.g. turned away by a half-open circuit.
    pub fn requeue(&self, batch_id: &str) -> Result<bool> {
        self.send_back(batch_id, None)
    }

    fn send_back(&self, batch_id: &str, max_retries: Option<u32>) -> Result<bool> {
        let retry_count = {
            let mut st = self.write();
            let failed = st
                .completed
                .get(batch_id)
                .map(|e| e.succeeded == Some(false));
            match failed {
                None => {
                    return Err(Error::validation_with_context(
                        format!("batch {} is not in the completed set", batch_id),
                        ErrorContext::new().with_source("batch_queue"),
                    ))
                }
                Some(false) => {
                    return Err(Error::validation_with_context(
                        format!("batch {} completed successfully", batch_id),
                        ErrorContext::new().with_source("batch_queue"),
                    ))
                }
                Some(true) => {}
            }
            let Some(mut entry) = st.completed.remove(batch_id) else {
                return Ok(false);
            };
            if let Some(max) = max_retries {
                if entry.retry_count >= max {
                    st.completed.insert(batch_id.to_string(), entry);
                    return Ok(false);
                }
                entry.retry_count += 1;
                st.counters.total_retried += 1;
            }
            entry.timestamp = Instant::now();
            entry.seq = st.take_seq();
            entry.completed_at = None;
            entry.succeeded = None;
            entry.batch.status = BatchStatus::Ready;
            st.index(&entry);
            let retry_count = entry.retry_count;
            st.pending.insert(batch_id.to_string(), entry);
            retry_count
        };
        info!(batch_id, retry_count, counted = max_retries.is_some(), "batch re-queued");
        self.events.emit(BatchEvent::BatchRetry {
            batch_id: batch_id.to_string(),
            retry_count,
        });
        Ok(true)
    }

    /// Drop a pending batch.
    pub fn remove(&self, batch_id: &str) -> Option<Batch> {
        let entry = {
            let mut st = self.write();
            let entry = st.pending.remove(batch_id)?;
            st.unindex(&entry);
            entry
        };
        self.events.emit(BatchEvent::BatchRemoved {
            batch_id: batch_id.to_string(),
        });
        Some(entry.batch)
    }

    /// Drop every pending and completed entry. Processing batches are left alone.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut st = self.write();
            let dropped = st.pending.len();
            st.pending.clear();
            st.completed.clear();
            st.by_priority.clear();
            st.by_zone.clear();
            st.by_endpoint.clear();
            dropped
        };
        self.events.emit(BatchEvent::QueueCleared { dropped });
        dropped
    }

    pub fn state_of(&self, batch_id: &str) -> Option<EntryState> {
        let st = self.read();
        if st.pending.contains_key(batch_id) {
            Some(EntryState::Pending)
        } else if st.processing.contains_key(batch_id) {
            Some(EntryState::Processing)
        } else if st.completed.contains_key(batch_id) {
            Some(EntryState::Completed)
        } else {
            None
        }
    }

    pub fn retry_count(&self, batch_id: &str) -> Option<u32> {
        let st = self.read();
        st.pending
            .get(batch_id)
            .or_else(|| st.processing.get(batch_id))
            .or_else(|| st.completed.get(batch_id))
            .map(|e| e.retry_count)
    }

    /// Pending batch ids targeting `endpoint`.
    pub fn pending_for_endpoint(&self, endpoint: &str) -> BTreeSet<String> {
        self.read()
            .by_endpoint
            .get(endpoint)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.read().pending.keys().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.read().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.read().processing.len()
    }

    pub fn is_accepting(&self) -> bool {
        !self.read().closed
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.read();
        let memory = st.entry_count() * self.config.bytes_per_batch;
        let mut processing_by_zone = BTreeMap::new();
        for e in st.processing.values() {
            *processing_by_zone.entry(e.batch.zone.clone()).or_insert(0) += 1;
        }
        QueueStats {
            pending: st.pending.len(),
            processing: st.processing.len(),
            completed: st.completed.len(),
            total_enqueued: st.counters.total_enqueued,
            total_processed: st.counters.total_processed,
            total_failed: st.counters.total_failed,
            total_retried: st.counters.total_retried,
            average_processing_time_ms: st.counters.average_processing_time_ms,
            average_wait_time_ms: st.counters.average_wait_time_ms,
            queue_utilization: self.utilization(st.pending.len()),
            memory_usage_bytes: memory,
            memory_utilization: if self.config.max_memory_bytes == 0 {
                1.0
            } else {
                memory as f64 / self.config.max_memory_bytes as f64
            },
            max_concurrent_batches: self.config.max_concurrent_batches,
            pending_by_priority: st
                .by_priority
                .iter()
                .map(|(p, ids)| (*p, ids.len()))
                .collect(),
            pending_by_zone: st
                .by_zone
                .iter()
                .map(|(z, ids)| (z.clone(), ids.len()))
                .collect(),
            processing_by_zone,
        }
    }

    /// Stop admission, wait for processing batches to drain, then clear everything.
    ///
    /// Returns `true` only if processing drained before the deadline and no pending batch
    /// had to be dropped. Pending batches are not dispatched from here; the caller drains
    /// them first.
    pub async fn shutdown(&self) -> bool {
        self.write().closed = true;
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut drained = true;
        loop {
            let processing = self.processing_len();
            if processing == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(processing, "queue shutdown deadline reached, forcing teardown");
                drained = false;
                break;
            }
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }
        let dropped = {
            let mut st = self.write();
            if !st.pending.is_empty() {
                warn!(pending = st.pending.len(), "dropping pending batches at shutdown");
                drained = false;
            }
            let dropped = st.pending.len() + st.processing.len();
            st.pending.clear();
            st.processing.clear();
            st.completed.clear();
            st.by_priority.clear();
            st.by_zone.clear();
            st.by_endpoint.clear();
            dropped
        };
        info!(dropped, drained, "batch queue shut down");
        self.events.emit(BatchEvent::QueueCleared { dropped });
        drained
    }
}

impl std::fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.read();
        f.debug_struct("BatchQueue")
            .field("pending", &st.pending.len())
            .field("processing", &st.processing.len())
            .field("completed", &st.completed.len())
            .field("closed", &st.closed)
            .finish()
    }
}
