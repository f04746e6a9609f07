//! 批处理管理器模块：请求接入、批次组装、策略触发、优化、排队与派发的总编排。
//!
//! # Batch Manager
//!
//! Root of the pipeline. A request handed to [`BatchManager::add_request`] joins a compatible
//! in-flight batch (same zone, endpoint and method, priority within two levels, younger than
//! the request's `max_delay_ms` hint) or opens a new one. The batch's strategy is consulted
//! after every addition, and a per-batch timer fires it when its timeout elapses. A fired
//! batch is optimized and queued; the background scheduler drains the queue into concurrent
//! dispatch tasks that call the processor through the circuit breaker, retry and rate
//! limiter. Outcomes flow back into metrics and the adaptive strategy.
//!
//! ```text
//! add_request ─> in-flight batch ─(strategy / timer)─> optimizer ─> queue
//!                                                                     │
//!    metrics <─ result <─ CircuitBreaker(Retry(RateLimiter + processor)) <─ scheduler
//! ```
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchManager`] | Cloneable handle: intake, `process_batch`, health, metrics, shutdown |
//! | [`BatchManagerBuilder`] | Processors, event sinks, alert rules, custom strategies |
//! | [`BatchManagerConfig`] | Serde/YAML configuration and the four presets |
//! | [`ManagerMetrics`] | Metrics, queue, breaker and throttle snapshot |
//!
//! ```rust,no_run
//! use api_batcher::manager::{BatchManager, BatchManagerConfig, Preset};
//! use api_batcher::processor::BatchProcessor;
//! use api_batcher::types::{BatchRequest, HttpMethod};
//! use std::sync::Arc;
//!
//! # async fn run(processor: Arc<dyn BatchProcessor>) -> api_batcher::Result<()> {
//! let manager = BatchManager::new(BatchManagerConfig::preset(Preset::Default), processor)?;
//! let req = BatchRequest::new("t-1", "/tickets", HttpMethod::Post, "z1").with_priority(5);
//! let outcome = manager.add_request(req)?;
//! let result = manager.process_batch(outcome.batch_id()).await?;
//! println!("{:?}", result.map(|r| r.success_rate()));
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod core;
mod dispatch;
mod intake;
mod scheduler;
mod signals;

pub use builder::BatchManagerBuilder;
pub use config::{BatchManagerConfig, CircuitBreakerSettings, Preset, QueueSettings, RetrySettings};
pub use core::{AddOutcome, BatchManager};
pub use signals::{CounterSnapshot, ManagerMetrics};
