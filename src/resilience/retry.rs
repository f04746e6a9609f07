//! Retry with exponential backoff.
//!
//! Wraps a single processor dispatch. Only errors that report themselves as
//! retryable (see [`crate::Error::is_retryable`]) are attempted again.

use crate::Result;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Configuration for retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt (0 = single attempt).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// +/-10% random spread on every delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }
    pub fn with_backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }
    pub fn with_jitter(mut self, j: bool) -> Self {
        self.jitter = j;
        self
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.config.base_delay.as_millis() as f64;
        let factor = self.config.backoff_multiplier.max(1.0).powi(retry as i32 - 1);
        let cap = self.config.max_delay.as_millis() as f64;
        let mut delay = (base * factor).min(cap);
        if self.config.jitter && delay > 0.0 {
            let spread = rand::thread_rng().gen_range(-0.1..=0.1);
            delay = (delay * (1.0 + spread)).min(cap);
        }
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or retries run out.
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "dispatch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retries performed across all calls.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}
