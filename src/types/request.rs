//! Inbound request model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Priority at or above which a request is treated as critical.
pub const CRITICAL_PRIORITY: u8 = 9;

/// HTTP verb of the target REST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied hints that steer batching for a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_batch_size: Option<usize>,
    /// Maximum age (ms) a batch may have for this request to join it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coalesceable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deduplication_fields: Vec<String>,
    /// Requests in the batch must reach the processor in arrival order.
    #[serde(default)]
    pub order_sensitive: bool,
}

impl BatchHints {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_preferred_batch_size(mut self, size: usize) -> Self {
        self.preferred_batch_size = Some(size);
        self
    }
    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = Some(ms);
        self
    }
    pub fn with_coalesceable(mut self, c: bool) -> Self {
        self.coalesceable = Some(c);
        self
    }
    pub fn with_order_sensitive(mut self, o: bool) -> Self {
        self.order_sensitive = o;
        self
    }
}

/// A single outbound API request waiting to be batched.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub zone: String,
    pub priority: u8,
    pub data: serde_json::Value,
    pub headers: Option<BTreeMap<String, String>>,
    pub batchable: bool,
    pub hints: Option<BatchHints>,
    /// Caller-provided duplicate key; overrides the computed fingerprint when present.
    pub fingerprint: Option<String>,
    pub created_at: Instant,
    /// Provenance written by the optimizer (coalesced sources, original priorities).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl BatchRequest {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        method: HttpMethod,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            method,
            zone: zone.into(),
            priority: 5,
            data: serde_json::Value::Null,
            headers: None,
            batchable: true,
            hints: None,
            fingerprint: None,
            created_at: Instant::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, p: u8) -> Self {
        self.priority = p;
        self
    }
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
    pub fn with_batchable(mut self, b: bool) -> Self {
        self.batchable = b;
        self
    }
    pub fn with_hints(mut self, hints: BatchHints) -> Self {
        self.hints = Some(hints);
        self
    }
    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }
    pub fn with_created_at(mut self, at: Instant) -> Self {
        self.created_at = at;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.priority >= CRITICAL_PRIORITY
    }

    /// `ceil(priority / 3)`; bounds how far apart priorities sharing a batch can be.
    pub fn priority_band(&self) -> u8 {
        self.priority.div_ceil(3)
    }

    /// `zone:endpoint:method:p<band>`
    pub fn batch_key(&self) -> String {
        format!(
            "{}:{}:{}:p{}",
            self.zone,
            self.endpoint,
            self.method,
            self.priority_band()
        )
    }

    /// False only when the caller explicitly opted out via hints.
    pub fn is_coalesceable(&self) -> bool {
        self.hints
            .as_ref()
            .and_then(|h| h.coalesceable)
            .unwrap_or(true)
    }

    pub fn is_order_sensitive(&self) -> bool {
        self.hints.as_ref().is_some_and(|h| h.order_sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_band_is_ceiling_of_thirds() {
        let bands: Vec<u8> = (1..=10)
            .map(|p| BatchRequest::new("r", "/t", HttpMethod::Get, "z").with_priority(p).priority_band())
            .collect();
        assert_eq!(bands, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4]);
    }

    #[test]
    fn test_batch_key_format() {
        let req = BatchRequest::new("r1", "/tickets", HttpMethod::Post, "z1").with_priority(8);
        assert_eq!(req.batch_key(), "z1:/tickets:POST:p3");
    }

    #[test]
    fn test_coalesceable_defaults_to_true() {
        let req = BatchRequest::new("r1", "/t", HttpMethod::Get, "z");
        assert!(req.is_coalesceable());
        let req = req.with_hints(BatchHints::new().with_coalesceable(false));
        assert!(!req.is_coalesceable());
    }

    #[test]
    fn test_method_serializes_uppercase() {
        let s = serde_json::to_string(&HttpMethod::Patch).unwrap();
        assert_eq!(s, "\"PATCH\"");
    }
}
