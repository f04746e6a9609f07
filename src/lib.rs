//! # api-batcher
//!
//! 面向限流 REST 后端的自适应请求批处理管线：接入、策略触发、批次优化、排队调度与弹性派发。
//!
//! Adaptive request batching for rate-limited REST backends. Many small outbound requests are
//! grouped into larger dispatches, sized and timed from live load and performance feedback.
//!
//! ## Overview
//!
//! The pipeline has five stages and a closed feedback loop:
//!
//! 1. **Intake**: requests join compatible in-flight batches keyed by
//!    `zone:endpoint:method:p<band>`.
//! 2. **Strategy**: a pluggable policy decides when a batch fires and how large it may grow.
//! 3. **Optimizer**: deduplication, coalescing, priority and zone ordering, adaptive sizing.
//! 4. **Queue**: admission control, priority/zone/endpoint indexes, bounded processing slots.
//! 5. **Dispatch**: `CircuitBreaker(Retry(RateLimiter + processor))`, then results feed the
//!    metrics collector, which feeds the next strategy decision.
//!
//! The network side is yours: implement [`processor::BatchProcessor`] and register it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_batcher::manager::BatchManager;
//! use api_batcher::processor::BatchProcessor;
//! use api_batcher::result::{BatchResult, BatchResultBuilder};
//! use api_batcher::types::{Batch, BatchRequest, HttpMethod};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl BatchProcessor for Echo {
//!     async fn process_batch(&self, batch: &Batch) -> api_batcher::Result<BatchResult> {
//!         let mut builder = BatchResultBuilder::for_batch(batch);
//!         for req in &batch.requests {
//!             builder.add_success(req.id.clone(), req.data.clone());
//!         }
//!         Ok(builder.build())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> api_batcher::Result<()> {
//!     let manager = BatchManager::builder()
//!         .default_processor(Arc::new(Echo))
//!         .build()?;
//!     let req = BatchRequest::new("t-1", "/tickets", HttpMethod::Post, "z1");
//!     manager.add_request(req)?;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | Orchestrator, builder, configuration and presets |
//! | [`strategy`] | Trigger, sizing and timeout policies |
//! | [`optimizer`] | Batch content transformations |
//! | [`queue`] | Indexed pending set with admission control |
//! | [`processor`] | External processor trait and routing |
//! | [`resilience`] | Circuit breaker, retry, rate limiter |
//! | [`metrics`] | Rolling counters, time series, alerts |
//! | [`result`] | Result builder and analyzer |
//! | [`events`] | Typed lifecycle events and sinks |
//! | [`types`] | Requests and batches |
//! | [`health`] | Tri-state health verdicts |

pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod optimizer;
pub mod processor;
pub mod queue;
pub mod resilience;
pub mod result;
pub mod strategy;
pub mod types;

// Re-export main types for convenience
pub use events::{BatchEvent, EventBus, EventSink};
pub use health::{HealthReport, HealthStatus};
pub use manager::{AddOutcome, BatchManager, BatchManagerBuilder, BatchManagerConfig, Preset};
pub use processor::{BatchProcessor, ProcessorHealth};
pub use result::{BatchResult, BatchResultBuilder};
pub use strategy::StrategyKind;
pub use types::{Batch, BatchHints, BatchRequest, HttpMethod};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{AdmissionKind, Error, ErrorContext};
