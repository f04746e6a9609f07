//! 弹性模式模块：熔断器、重试退避与派发限流。
//!
//! # Resilience Primitives Module
//!
//! Every dispatch to a [`crate::processor::BatchProcessor`] runs inside
//! `CircuitBreaker(Retry(RateLimiter + processor))`. These are the only places where a
//! dispatch may legitimately wait (backoff sleeps, throttling) or fail fast (open circuit);
//! all of them are per-call, none is a global lock.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / open / half-open failure isolation |
//! | [`retry`] | Bounded retries with exponential backoff |
//! | [`rate_limiter`] | Token bucket throttle for dispatches |
//!
//! ```rust
//! use api_batcher::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_cooldown(Duration::from_secs(30)),
//! );
//! assert!(breaker.allow().is_ok());
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
pub use retry::{RetryConfig, RetryPolicy};
