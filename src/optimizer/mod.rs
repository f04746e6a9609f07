//! 批次优化模块：去重、合并、优先级排序、分区排序与自适应裁剪。
//!
//! # Batch Optimizer
//!
//! Rewrites the request list of a batch that has been claimed for dispatch. Five stages run
//! in a fixed order, each independently toggleable:
//!
//! 1. **Deduplication**: first occurrence of each [`fingerprint`] wins
//! 2. **Coalescing**: similar, mutually eligible requests merge into one synthetic request
//! 3. **Priority optimization**: stable sort by priority desc, then age
//! 4. **Zone optimization**: group by zone in first-seen order
//! 5. **Adaptive sizing**: cap batches for endpoints known to choke on large payloads
//!
//! The optimizer never blocks processing. If anything goes wrong it hands back the batch it
//! was given, untouched.
//!
//! ```rust
//! use api_batcher::optimizer::{BatchOptimizer, OptimizerConfig};
//! use api_batcher::types::{Batch, BatchRequest, HttpMethod};
//! use std::time::Duration;
//!
//! let first = BatchRequest::new("r1", "/tickets", HttpMethod::Post, "z1");
//! let mut batch = Batch::for_request(&first, 10, Duration::from_secs(1));
//! batch.push(first.clone());
//! batch.push(BatchRequest { id: "r2".into(), ..first });
//!
//! let optimized = BatchOptimizer::new(OptimizerConfig::default()).optimize(batch);
//! assert_eq!(optimized.batch.len(), 1);
//! ```

mod coalesce;
mod fingerprint;

pub use fingerprint::{can_coalesce, fingerprint, similarity, FINGERPRINT_LEN};

use crate::types::{Batch, BatchRequest, OptimizationMetadata};
use crate::{Error, ErrorContext, Result};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};

pub const STAGE_DEDUPLICATION: &str = "deduplication";
pub const STAGE_COALESCING: &str = "coalescing";
pub const STAGE_PRIORITY: &str = "priority_optimization";
pub const STAGE_ZONE: &str = "zone_optimization";
pub const STAGE_ADAPTIVE_SIZING: &str = "adaptive_sizing";

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub enable_deduplication: bool,
    pub enable_coalescing: bool,
    pub enable_priority_optimization: bool,
    pub enable_zone_optimization: bool,
    pub enable_adaptive_sizing: bool,
    pub similarity_threshold: f64,
    /// Coalescing only runs on batches at least this large.
    pub min_coalesce_batch_size: usize,
    /// Endpoint substrings whose batches are capped at `problematic_batch_limit`.
    pub problematic_endpoints: Vec<String>,
    pub problematic_batch_limit: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            enable_coalescing: true,
            enable_priority_optimization: true,
            enable_zone_optimization: true,
            enable_adaptive_sizing: true,
            similarity_threshold: 0.8,
            min_coalesce_batch_size: 3,
            problematic_endpoints: vec![
                "/tickets".to_string(),
                "/projects".to_string(),
                "/companies".to_string(),
            ],
            problematic_batch_limit: 50,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_deduplication(mut self, on: bool) -> Self {
        self.enable_deduplication = on;
        self
    }
    pub fn with_coalescing(mut self, on: bool) -> Self {
        self.enable_coalescing = on;
        self
    }
    pub fn with_priority_optimization(mut self, on: bool) -> Self {
        self.enable_priority_optimization = on;
        self
    }
    pub fn with_zone_optimization(mut self, on: bool) -> Self {
        self.enable_zone_optimization = on;
        self
    }
    pub fn with_adaptive_sizing(mut self, on: bool) -> Self {
        self.enable_adaptive_sizing = on;
        self
    }
    pub fn with_similarity_threshold(mut self, t: f64) -> Self {
        self.similarity_threshold = t;
        self
    }
}

/// Optimizer output.
#[derive(Debug, Clone)]
pub struct OptimizedBatch {
    pub batch: Batch,
    /// Requests cut by adaptive sizing; the caller re-admits them.
    pub deferred: Vec<BatchRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptimizer {
    config: OptimizerConfig,
}

impl BatchOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Run all enabled stages. Falls back to the original batch on any internal error.
    pub fn optimize(&self, batch: Batch) -> OptimizedBatch {
        match self.try_optimize(&batch) {
            Ok(out) => {
                if let Some(meta) = &out.batch.metadata.optimization {
                    debug!(
                        batch_id = %out.batch.id,
                        original_size = meta.original_size,
                        optimized_size = meta.optimized_size,
                        duplicates_removed = meta.duplicates_removed,
                        requests_coalesced = meta.requests_coalesced,
                        deferred = out.deferred.len(),
                        "batch optimized"
                    );
                }
                out
            }
            Err(e) => {
                warn!(batch_id = %batch.id, error = %e, "optimization failed, using original batch");
                OptimizedBatch {
                    batch,
                    deferred: Vec::new(),
                }
            }
        }
    }

    fn try_optimize(&self, batch: &Batch) -> Result<OptimizedBatch> {
        if batch.is_empty() {
            return Err(Error::optimization_with_context(
                "batch has no requests",
                ErrorContext::new().with_details(format!("batch_id={}", batch.id)),
            ));
        }
        let started = Instant::now();
        let cfg = &self.config;
        let original_size = batch.len();
        let mut requests = batch.requests.clone();
        let mut meta = OptimizationMetadata {
            original_size,
            ..Default::default()
        };

        if cfg.enable_deduplication {
            let (kept, removed) = deduplicate(requests);
            requests = kept;
            meta.duplicates_removed = removed;
            if removed > 0 {
                meta.optimizations.push(STAGE_DEDUPLICATION.to_string());
            }
        }

        if cfg.enable_coalescing && requests.len() >= cfg.min_coalesce_batch_size {
            let (merged, absorbed) = coalesce::coalesce(requests, cfg.similarity_threshold);
            requests = merged;
            meta.requests_coalesced = absorbed;
            if absorbed > 0 {
                meta.optimizations.push(STAGE_COALESCING.to_string());
            }
        }

        // One order-sensitive request pins the arrival order of the whole batch.
        let keep_order = requests.iter().any(BatchRequest::is_order_sensitive);
        if keep_order {
            debug!(batch_id = %batch.id, "order-sensitive batch, skipping reordering");
        }

        if cfg.enable_priority_optimization && !keep_order {
            sort_by_priority(&mut requests);
            meta.optimizations.push(STAGE_PRIORITY.to_string());
        }

        if cfg.enable_zone_optimization && !keep_order {
            requests = group_by_zone(requests);
            meta.optimizations.push(STAGE_ZONE.to_string());
        }

        let mut max_size = batch.max_size;
        let mut deferred = Vec::new();
        if cfg.enable_adaptive_sizing
            && requests.len() > cfg.problematic_batch_limit
            && self.is_problematic(&batch.endpoint)
        {
            deferred = requests.split_off(cfg.problematic_batch_limit);
            max_size = cfg.problematic_batch_limit;
            meta.optimizations.push(STAGE_ADAPTIVE_SIZING.to_string());
        }

        if requests.is_empty() {
            return Err(Error::optimization_with_context(
                "optimization produced an empty batch",
                ErrorContext::new().with_details(format!("batch_id={}", batch.id)),
            ));
        }

        meta.optimized_size = requests.len();
        meta.processing_time_us = started.elapsed().as_micros() as u64;

        let mut out = batch.clone();
        out.requests = requests;
        out.max_size = max_size;
        out.refresh_priority();
        out.metadata.optimization = Some(meta);
        Ok(OptimizedBatch {
            batch: out,
            deferred,
        })
    }

    fn is_problematic(&self, endpoint: &str) -> bool {
        self.config
            .problematic_endpoints
            .iter()
            .any(|p| endpoint.contains(p.as_str()))
    }
}

/// Drop requests whose fingerprint was already seen; order is preserved.
fn deduplicate(requests: Vec<BatchRequest>) -> (Vec<BatchRequest>, usize) {
    let before = requests.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<BatchRequest> = requests
        .into_iter()
        .filter(|r| seen.insert(fingerprint(r)))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Priority desc, older first on ties.
fn sort_by_priority(requests: &mut [BatchRequest]) {
    requests.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Zone groups in first-seen order; inside a group priority desc, endpoint, then age.
fn group_by_zone(requests: Vec<BatchRequest>) -> Vec<BatchRequest> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<BatchRequest>> = HashMap::new();
    for r in requests {
        if !groups.contains_key(&r.zone) {
            order.push(r.zone.clone());
        }
        groups.entry(r.zone.clone()).or_default().push(r);
    }
    let mut out = Vec::new();
    for zone in order {
        if let Some(mut group) = groups.remove(&zone) {
            group.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.endpoint.cmp(&b.endpoint))
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
            out.extend(group);
        }
    }
    out
}
