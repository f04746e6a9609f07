//! Built-in event sinks.

use super::{BatchEvent, EventEnvelope, EventKind, EventSink};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// In-memory sink for tests and inspection. Keeps the newest `max_events`.
pub struct InMemoryEventSink {
    events: RwLock<VecDeque<EventEnvelope>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_events: max.max(1),
        }
    }
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
    pub fn events_of(&self, kind: EventKind) -> Vec<EventEnvelope> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemoryEventSink {
    fn report(&self, event: &EventEnvelope) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push_back(event.clone());
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}

/// Mirrors events into `tracing`; warnings for the ones an operator should see.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn report(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            BatchEvent::QueueFull {
                pending,
                max_queue_size,
            } => warn!(pending, max_queue_size, "queue.full"),
            BatchEvent::QueueWarning {
                utilization,
                threshold,
            } => warn!(utilization, threshold, "queue.warning"),
            BatchEvent::MetricsAlert {
                rule,
                metric,
                value,
                threshold,
            } => warn!(rule = %rule, metric = %metric, value, threshold, "metrics.alert"),
            BatchEvent::RequestFailedPermanent {
                request_id,
                batch_id,
                error,
            } => warn!(request_id = %request_id, batch_id = %batch_id, error = %error, "request.failed.permanent"),
            BatchEvent::CircuitStateChanged { from, to } => {
                warn!(from = ?from, to = ?to, "circuit.state.changed")
            }
            other => debug!(event = other.name(), payload = ?other, "batch lifecycle event"),
        }
    }
}

/// Closure adapter.
pub struct FnEventSink<F> {
    func: F,
}

impl<F> FnEventSink<F>
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> EventSink for FnEventSink<F>
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    fn report(&self, event: &EventEnvelope) {
        (self.func)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn removed(id: &str) -> EventEnvelope {
        EventEnvelope::new(BatchEvent::BatchRemoved {
            batch_id: id.to_string(),
        })
    }

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryEventSink::new(2);
        sink.report(&removed("a"));
        sink.report(&removed("b"));
        sink.report(&removed("c"));
        let ids: Vec<String> = sink
            .events()
            .into_iter()
            .map(|e| match e.event {
                BatchEvent::BatchRemoved { batch_id } => batch_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_count_by_kind() {
        let sink = InMemoryEventSink::new(10);
        sink.report(&removed("a"));
        sink.report(&EventEnvelope::new(BatchEvent::QueueCleared { dropped: 0 }));
        assert_eq!(sink.count(EventKind::BatchRemoved), 1);
        assert_eq!(sink.count(EventKind::QueueCleared), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_fn_sink_invokes_closure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sink = FnEventSink::new(move |_e: &EventEnvelope| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sink.report(&removed("x"));
        sink.report(&removed("y"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
