//! 批处理执行器模块：外部处理器接口与按分区/端点的路由。
//!
//! # Batch Processors
//!
//! The component that actually talks to the remote API is supplied by the caller through
//! [`BatchProcessor`]. [`ProcessorRegistry`] picks one per batch: zone routes first, then
//! endpoint routes, then the mandatory default.

use crate::health::{HealthReport, HealthStatus};
use crate::result::BatchResult;
use crate::types::Batch;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProcessorHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Executes a batch against the remote backend.
///
/// Implementations return `Err` only when the whole dispatch failed; per-request failures
/// belong in the [`BatchResult`]. Use [`Error::processing`] with `retryable = true` for
/// transient failures so the retry wrapper tries again.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    fn name(&self) -> &str {
        "processor"
    }

    async fn process_batch(&self, batch: &Batch) -> Result<BatchResult>;

    fn can_process(&self, _batch: &Batch) -> bool {
        true
    }

    async fn health(&self) -> ProcessorHealth {
        ProcessorHealth::healthy()
    }
}

/// Match condition of a registered processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorRoute {
    Zone(String),
    Endpoint(String),
}

impl ProcessorRoute {
    pub fn matches(&self, batch: &Batch) -> bool {
        match self {
            ProcessorRoute::Zone(z) => &batch.zone == z,
            ProcessorRoute::Endpoint(e) => &batch.endpoint == e,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ProcessorRoute::Zone(_) => 0,
            ProcessorRoute::Endpoint(_) => 1,
        }
    }
}

type Route = (ProcessorRoute, Arc<dyn BatchProcessor>);

/// Ordered processor lookup with a mandatory fallback.
pub struct ProcessorRegistry {
    routes: RwLock<Vec<Route>>,
    default: RwLock<Arc<dyn BatchProcessor>>,
}

impl ProcessorRegistry {
    pub fn new(default: Arc<dyn BatchProcessor>) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            default: RwLock::new(default),
        }
    }

    /// Add a route. Zone routes are always tried before endpoint routes; within a kind,
    /// registration order wins.
    pub fn register(&self, route: ProcessorRoute, processor: Arc<dyn BatchProcessor>) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.push((route, processor));
        routes.sort_by_key(|(r, _)| r.rank());
    }

    pub fn register_zone(&self, zone: impl Into<String>, processor: Arc<dyn BatchProcessor>) {
        self.register(ProcessorRoute::Zone(zone.into()), processor);
    }

    pub fn register_endpoint(&self, endpoint: impl Into<String>, processor: Arc<dyn BatchProcessor>) {
        self.register(ProcessorRoute::Endpoint(endpoint.into()), processor);
    }

    pub fn set_default(&self, processor: Arc<dyn BatchProcessor>) {
        *self.default.write().unwrap_or_else(PoisonError::into_inner) = processor;
    }

    pub fn route_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// First matching processor that accepts the batch.
    pub fn select(&self, batch: &Batch) -> Result<Arc<dyn BatchProcessor>> {
        let routed = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(route, p)| route.matches(batch) && p.can_process(batch))
            .map(|(_, p)| p.clone());
        if let Some(p) = routed {
            return Ok(p);
        }
        let default = self
            .default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if default.can_process(batch) {
            return Ok(default);
        }
        Err(Error::configuration_with_context(
            "no processor can handle batch",
            ErrorContext::new()
                .with_details(format!(
                    "batch_id={} zone={} endpoint={}",
                    batch.id, batch.zone, batch.endpoint
                ))
                .with_source("processor_registry"),
        ))
    }

    /// Worst health across every registered processor.
    pub async fn health(&self) -> HealthReport {
        let mut processors: Vec<Arc<dyn BatchProcessor>> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, p)| p.clone())
            .collect();
        processors.push(
            self.default
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );

        let mut report = HealthReport::healthy();
        for p in processors {
            let h = p.health().await;
            if h.status != HealthStatus::Healthy {
                let message = h.message.unwrap_or_else(|| h.status.to_string());
                report.flag(h.status, format!("processor {}: {}", p.name(), message));
            }
        }
        report
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("routes", &self.route_count())
            .finish()
    }
}
