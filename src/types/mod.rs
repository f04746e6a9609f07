//! Core type definitions for requests and batches.

pub mod batch;
pub mod request;

pub use batch::{Batch, BatchMetadata, BatchStatus, OptimizationMetadata, MAX_PROTOCOL_BATCH_SIZE};
pub use request::{BatchHints, BatchRequest, HttpMethod, CRITICAL_PRIORITY};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; used for event stamps and synthetic ids.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
