//! 生命周期事件模块：批次、队列、策略、熔断器事件的类型化广播。
//!
//! # Lifecycle Events Module
//!
//! Every component of the pipeline reports what it did through a closed set of typed
//! events. Observers subscribe an [`EventSink`] on the shared [`EventBus`]; there is no
//! string-keyed dispatch table.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchEvent`] | Closed enum of event kinds with a typed payload per kind |
//! | [`EventEnvelope`] | `{type, timestamp, data}` wrapper delivered to sinks |
//! | [`EventSink`] | Trait for event destinations |
//! | [`EventBus`] | Fan-out registry shared by queue, manager and metrics |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for tests and inspection |
//! | [`TracingEventSink`] | Mirrors events to `tracing` |
//! | [`FnEventSink`] | Closure adapter |

mod sinks;

pub use sinks::{FnEventSink, InMemoryEventSink, TracingEventSink};

use crate::resilience::circuit_breaker::CircuitState;
use crate::types::epoch_millis;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Discriminant of [`BatchEvent`], handy for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BatchCreated,
    BatchEnqueued,
    BatchDequeued,
    BatchCompleted,
    BatchFailed,
    BatchRetry,
    BatchRemoved,
    QueueFull,
    QueueWarning,
    QueueCleared,
    StrategyChanged,
    MetricsAlert,
    CircuitStateChanged,
    RequestRetryScheduled,
    RequestFailedPermanent,
}

/// Typed lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchEvent {
    #[serde(rename = "batch.created")]
    BatchCreated {
        batch_id: String,
        key: String,
        strategy: String,
        max_size: usize,
        timeout_ms: u64,
    },
    #[serde(rename = "batch.enqueued")]
    BatchEnqueued {
        batch_id: String,
        priority: u8,
        size: usize,
        pending: usize,
    },
    #[serde(rename = "batch.dequeued")]
    BatchDequeued { batch_id: String, wait_ms: u64 },
    #[serde(rename = "batch.completed")]
    BatchCompleted { batch_id: String, processing_ms: u64 },
    #[serde(rename = "batch.failed")]
    BatchFailed { batch_id: String, reason: String },
    #[serde(rename = "batch.retry")]
    BatchRetry { batch_id: String, retry_count: u32 },
    #[serde(rename = "batch.removed")]
    BatchRemoved { batch_id: String },
    #[serde(rename = "queue.full")]
    QueueFull { pending: usize, max_queue_size: usize },
    #[serde(rename = "queue.warning")]
    QueueWarning { utilization: f64, threshold: f64 },
    #[serde(rename = "queue.cleared")]
    QueueCleared { dropped: usize },
    #[serde(rename = "strategy.changed")]
    StrategyChanged { from: String, to: String },
    #[serde(rename = "metrics.alert")]
    MetricsAlert {
        rule: String,
        metric: String,
        value: f64,
        threshold: f64,
    },
    #[serde(rename = "circuit.state.changed")]
    CircuitStateChanged { from: CircuitState, to: CircuitState },
    #[serde(rename = "request.retry.scheduled")]
    RequestRetryScheduled {
        request_id: String,
        batch_id: String,
        delay_ms: u64,
        error: String,
    },
    #[serde(rename = "request.failed.permanent")]
    RequestFailedPermanent {
        request_id: String,
        batch_id: String,
        error: String,
    },
}

impl BatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BatchEvent::BatchCreated { .. } => EventKind::BatchCreated,
            BatchEvent::BatchEnqueued { .. } => EventKind::BatchEnqueued,
            BatchEvent::BatchDequeued { .. } => EventKind::BatchDequeued,
            BatchEvent::BatchCompleted { .. } => EventKind::BatchCompleted,
            BatchEvent::BatchFailed { .. } => EventKind::BatchFailed,
            BatchEvent::BatchRetry { .. } => EventKind::BatchRetry,
            BatchEvent::BatchRemoved { .. } => EventKind::BatchRemoved,
            BatchEvent::QueueFull { .. } => EventKind::QueueFull,
            BatchEvent::QueueWarning { .. } => EventKind::QueueWarning,
            BatchEvent::QueueCleared { .. } => EventKind::QueueCleared,
            BatchEvent::StrategyChanged { .. } => EventKind::StrategyChanged,
            BatchEvent::MetricsAlert { .. } => EventKind::MetricsAlert,
            BatchEvent::CircuitStateChanged { .. } => EventKind::CircuitStateChanged,
            BatchEvent::RequestRetryScheduled { .. } => EventKind::RequestRetryScheduled,
            BatchEvent::RequestFailedPermanent { .. } => EventKind::RequestFailedPermanent,
        }
    }

    /// Dotted wire name, e.g. `batch.enqueued`.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            EventKind::BatchCreated => "batch.created",
            EventKind::BatchEnqueued => "batch.enqueued",
            EventKind::BatchDequeued => "batch.dequeued",
            EventKind::BatchCompleted => "batch.completed",
            EventKind::BatchFailed => "batch.failed",
            EventKind::BatchRetry => "batch.retry",
            EventKind::BatchRemoved => "batch.removed",
            EventKind::QueueFull => "queue.full",
            EventKind::QueueWarning => "queue.warning",
            EventKind::QueueCleared => "queue.cleared",
            EventKind::StrategyChanged => "strategy.changed",
            EventKind::MetricsAlert => "metrics.alert",
            EventKind::CircuitStateChanged => "circuit.state.changed",
            EventKind::RequestRetryScheduled => "request.retry.scheduled",
            EventKind::RequestFailedPermanent => "request.failed.permanent",
        }
    }
}

/// Event plus emission time (Unix ms). Serializes as `{type, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: BatchEvent,
}

impl EventEnvelope {
    pub fn new(event: BatchEvent) -> Self {
        Self {
            timestamp: epoch_millis(),
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Destination for lifecycle events.
///
/// Sinks are invoked synchronously on the emitting task and must not block.
pub trait EventSink: Send + Sync {
    fn report(&self, event: &EventEnvelope);
}

/// Shared fan-out of events to every subscribed sink.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn emit(&self, event: BatchEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if sinks.is_empty() {
            return;
        }
        let envelope = EventEnvelope::new(event);
        for sink in sinks {
            sink.report(&envelope);
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fans_out_to_all_sinks() {
        let bus = EventBus::new();
        let a = Arc::new(InMemoryEventSink::new(10));
        let b = Arc::new(InMemoryEventSink::new(10));
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.emit(BatchEvent::BatchRemoved {
            batch_id: "b1".into(),
        });

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a.events()[0].kind(), EventKind::BatchRemoved);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = EventEnvelope::new(BatchEvent::QueueCleared { dropped: 3 });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "queue.cleared");
        assert_eq!(json["data"]["dropped"], 3);
        assert!(json["timestamp"].as_u64().is_some());
    }

    #[test]
    fn test_names_match_wire_tags() {
        let event = BatchEvent::RequestRetryScheduled {
            request_id: "r".into(),
            batch_id: "b".into(),
            delay_ms: 5,
            error: "timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
    }
}
