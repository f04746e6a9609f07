//! Batch result model and incremental builder.

use crate::types::{epoch_millis, Batch};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Error reported for one request of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub name: String,
    pub message: String,
}

impl RequestError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::Error> for RequestError {
    fn from(e: &crate::Error) -> Self {
        Self::new(e.kind_name(), e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub processing_time_ms: u64,
    pub response_size: usize,
}

impl RequestResult {
    pub fn success(request_id: impl Into<String>, data: serde_json::Value) -> Self {
        let response_size = data.to_string().len();
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            status_code: Some(200),
            processing_time_ms: 0,
            response_size,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: RequestError) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error),
            status_code: None,
            processing_time_ms: 0,
            response_size: 0,
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_processing_time(mut self, d: Duration) -> Self {
        self.processing_time_ms = d.as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub start_time: u64,
    pub end_time: u64,
    pub processing_time_ms: u64,
    pub batch_size: usize,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default)]
    pub optimizations: Vec<String>,
}

/// Outcome of one batch dispatch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    /// More than half of the individual requests succeeded.
    pub success: bool,
    pub results: Vec<RequestResult>,
    pub metadata: ResultMetadata,
}

impl BatchResult {
    /// Synthetic result marking every request of `batch` as failed with `error`.
    pub fn all_failed(batch: &Batch, error: RequestError) -> Self {
        let mut builder = BatchResultBuilder::for_batch(batch);
        for req in &batch.requests {
            builder.add_result(RequestResult::failure(req.id.clone(), error.clone()));
        }
        builder.build()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &RequestResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn success_rate(&self) -> f64 {
        self.metadata.success_rate
    }

    pub fn processing_time(&self) -> Duration {
        Duration::from_millis(self.metadata.processing_time_ms)
    }
}

/// Accumulates per-request results while a batch is being processed.
pub struct BatchResultBuilder {
    batch_id: String,
    results: Vec<RequestResult>,
    started: Instant,
    start_time: u64,
    batch_size: Option<usize>,
    strategy: Option<String>,
    optimizations: Vec<String>,
}

impl BatchResultBuilder {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            results: Vec::new(),
            started: Instant::now(),
            start_time: epoch_millis(),
            batch_size: None,
            strategy: None,
            optimizations: Vec::new(),
        }
    }

    /// Builder pre-filled with the batch's id, size, strategy and optimization trail.
    pub fn for_batch(batch: &Batch) -> Self {
        let mut b = Self::new(batch.id.clone()).with_batch_size(batch.len());
        if let Some(s) = &batch.metadata.strategy {
            b = b.with_strategy(s.clone());
        }
        if let Some(opt) = &batch.metadata.optimization {
            b = b.with_optimizations(opt.optimizations.clone());
        }
        b
    }

    pub fn with_strategy(mut self, s: impl Into<String>) -> Self {
        self.strategy = Some(s.into());
        self
    }

    pub fn with_optimizations(mut self, o: Vec<String>) -> Self {
        self.optimizations = o;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    pub fn add_result(&mut self, r: RequestResult) -> &mut Self {
        self.results.push(r);
        self
    }

    pub fn add_success(&mut self, request_id: impl Into<String>, data: serde_json::Value) -> &mut Self {
        self.add_result(RequestResult::success(request_id, data))
    }

    pub fn add_failure(&mut self, request_id: impl Into<String>, error: RequestError) -> &mut Self {
        self.add_result(RequestResult::failure(request_id, error))
    }

    pub fn build(self) -> BatchResult {
        let total = self.results.len();
        let succeeded = self.results.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 / total as f64
        };
        BatchResult {
            batch_id: self.batch_id,
            success: success_rate > 0.5,
            metadata: ResultMetadata {
                start_time: self.start_time,
                end_time: epoch_millis(),
                processing_time_ms: self.started.elapsed().as_millis() as u64,
                batch_size: self.batch_size.unwrap_or(total),
                success_rate,
                strategy: self.strategy,
                optimizations: self.optimizations,
            },
            results: self.results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchRequest, HttpMethod};
    use serde_json::json;

    #[test]
    fn test_empty_build_is_failure() {
        let result = BatchResultBuilder::new("b1").build();
        assert!(!result.success);
        assert_eq!(result.metadata.success_rate, 0.0);
        assert_eq!(result.metadata.batch_size, 0);
    }

    #[test]
    fn test_all_success() {
        let mut builder = BatchResultBuilder::new("b1").with_strategy("hybrid");
        builder.add_success("r1", json!({"id": 1}));
        builder.add_success("r2", json!({"id": 2}));
        let result = builder.build();
        assert!(result.success);
        assert_eq!(result.metadata.success_rate, 1.0);
        assert_eq!(result.metadata.strategy.as_deref(), Some("hybrid"));
    }

    #[test]
    fn test_half_is_not_success() {
        let mut builder = BatchResultBuilder::new("b1");
        builder
            .add_success("r1", json!(null))
            .add_failure("r2", RequestError::new("TimeoutError", "timed out"));
        let result = builder.build();
        assert_eq!(result.metadata.success_rate, 0.5);
        assert!(!result.success);
        assert_eq!(result.failure_count(), 1);
    }

    #[test]
    fn test_all_failed_covers_every_request() {
        let first = BatchRequest::new("a", "/tickets", HttpMethod::Post, "z1");
        let mut batch = Batch::for_request(&first, 10, Duration::from_secs(1));
        batch.push(first);
        batch.push(BatchRequest::new("b", "/tickets", HttpMethod::Post, "z1"));

        let result = BatchResult::all_failed(&batch, RequestError::new("ProcessingError", "down"));
        assert_eq!(result.results.len(), 2);
        assert!(result.results.iter().all(|r| !r.success));
        assert_eq!(result.metadata.batch_size, 2);
        assert!(!result.success);
    }

    #[test]
    fn test_success_result_measures_response_size() {
        let r = RequestResult::success("r", json!({"k": "v"}));
        assert_eq!(r.response_size, "{\"k\":\"v\"}".len());
    }
}
