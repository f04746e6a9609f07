//! Batch model.

use super::request::{BatchRequest, HttpMethod};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Hard per-dispatch request limit imposed by the remote protocol.
pub const MAX_PROTOCOL_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Ready,
    Processing,
    Completed,
    Failed,
}

/// Provenance recorded by the optimizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationMetadata {
    pub original_size: usize,
    pub optimized_size: usize,
    pub duplicates_removed: usize,
    pub requests_coalesced: usize,
    pub optimizations: Vec<String>,
    pub processing_time_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationMetadata>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A group of compatible requests dispatched together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub priority: u8,
    pub requests: Vec<BatchRequest>,
    pub zone: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub created_at: Instant,
    pub max_size: usize,
    pub timeout: Duration,
    pub status: BatchStatus,
    pub metadata: BatchMetadata,
}

impl Batch {
    /// Start a collecting batch shaped after its first request.
    pub fn for_request(request: &BatchRequest, max_size: usize, timeout: Duration) -> Self {
        Self {
            id: format!("batch_{}", uuid::Uuid::new_v4().simple()),
            priority: request.priority,
            requests: Vec::new(),
            zone: request.zone.clone(),
            endpoint: request.endpoint.clone(),
            method: request.method,
            created_at: Instant::now(),
            max_size: max_size.clamp(1, MAX_PROTOCOL_BATCH_SIZE),
            timeout,
            status: BatchStatus::Collecting,
            metadata: BatchMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_created_at(mut self, at: Instant) -> Self {
        self.created_at = at;
        self
    }

    /// Append a request, raising the batch priority when needed.
    pub fn push(&mut self, request: BatchRequest) {
        if request.priority > self.priority {
            self.priority = request.priority;
        }
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.max_size
    }

    /// Recompute priority as the max over current requests.
    pub fn refresh_priority(&mut self) {
        if let Some(p) = self.requests.iter().map(|r| r.priority).max() {
            self.priority = p;
        }
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str, p: u8) -> BatchRequest {
        BatchRequest::new(id, "/companies", HttpMethod::Get, "z1").with_priority(p)
    }

    #[test]
    fn test_push_tracks_max_priority() {
        let first = req("a", 3);
        let mut batch = Batch::for_request(&first, 10, Duration::from_secs(1));
        batch.push(first);
        batch.push(req("b", 6));
        batch.push(req("c", 4));
        assert_eq!(batch.priority, 6);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_max_size_is_capped_at_protocol_limit() {
        let batch = Batch::for_request(&req("a", 1), 10_000, Duration::from_secs(1));
        assert_eq!(batch.max_size, MAX_PROTOCOL_BATCH_SIZE);
    }

    #[test]
    fn test_refresh_priority_after_removal() {
        let first = req("a", 9);
        let mut batch = Batch::for_request(&first, 10, Duration::from_secs(1));
        batch.push(first);
        batch.push(req("b", 2));
        batch.requests.remove(0);
        batch.refresh_priority();
        assert_eq!(batch.priority, 2);
    }
}
