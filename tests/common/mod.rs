#![allow(dead_code)]

use api_batcher::events::{EventKind, InMemoryEventSink};
use api_batcher::processor::{BatchProcessor, ProcessorHealth};
use api_batcher::result::{BatchResult, BatchResultBuilder, RequestError};
use api_batcher::types::{Batch, BatchRequest, HttpMethod};
use api_batcher::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Processor that records every batch it sees.
///
/// A request whose `data.fail` is a string fails with that string as the error message.
/// Whole-batch errors can be scripted per call with [`RecordingProcessor::fail_next`].
#[derive(Default)]
pub struct RecordingProcessor {
    pub seen: Mutex<Vec<Batch>>,
    pub calls: AtomicUsize,
    scripted: Mutex<VecDeque<Error>>,
    delay: Option<Duration>,
    health: Option<ProcessorHealth>,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn reporting(health: ProcessorHealth) -> Arc<Self> {
        Arc::new(Self {
            health: Some(health),
            ..Self::default()
        })
    }

    pub fn fail_next(&self, error: Error) {
        self.scripted.lock().unwrap().push_back(error);
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every original request id that reached the processor.
    pub fn delivered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .batches()
            .iter()
            .flat_map(|b| b.requests.iter())
            .flat_map(|r| match r.metadata.get("coalesced_from").and_then(|v| v.as_array()) {
                Some(sources) => sources
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect::<Vec<_>>(),
                None => vec![r.id.clone()],
            })
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BatchProcessor for RecordingProcessor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn process_batch(&self, batch: &Batch) -> Result<BatchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.seen.lock().unwrap().push(batch.clone());

        let mut builder = BatchResultBuilder::for_batch(batch);
        for req in &batch.requests {
            match req.data.get("fail").and_then(|v| v.as_str()) {
                Some(message) => {
                    builder.add_failure(req.id.clone(), RequestError::new("RemoteError", message));
                }
                None => {
                    builder.add_success(req.id.clone(), req.data.clone());
                }
            }
        }
        Ok(builder.build())
    }

    async fn health(&self) -> ProcessorHealth {
        self.health.clone().unwrap_or_else(ProcessorHealth::healthy)
    }
}

pub fn ticket(id: &str, priority: u8) -> BatchRequest {
    BatchRequest::new(id, "/tickets", HttpMethod::Post, "z1")
        .with_priority(priority)
        .with_data(serde_json::json!({ "subject": id }))
}

pub fn memory_sink() -> Arc<InMemoryEventSink> {
    Arc::new(InMemoryEventSink::new(1000))
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn count(sink: &InMemoryEventSink, kind: EventKind) -> usize {
    sink.count(kind)
}
