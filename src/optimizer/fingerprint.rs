//! Request fingerprints and pairwise similarity.

use crate::types::BatchRequest;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hex length of a computed fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Duplicate key of a request.
///
/// A caller-supplied fingerprint wins. Otherwise the key is the first 16 hex chars of
/// SHA-256 over the canonical `{endpoint, method, zone, data, headers}` tuple. When the
/// request names `deduplication_fields`, only those top-level data fields take part.
pub fn fingerprint(request: &BatchRequest) -> String {
    if let Some(fp) = &request.fingerprint {
        return fp.clone();
    }
    let mut parts: BTreeMap<&str, String> = BTreeMap::new();
    parts.insert("endpoint", request.endpoint.clone());
    parts.insert("method", request.method.as_str().to_string());
    parts.insert("zone", request.zone.clone());
    parts.insert("data", canonical_data(request));
    parts.insert(
        "headers",
        serde_json::to_string(&request.headers).unwrap_or_default(),
    );
    let canonical = serde_json::to_string(&parts).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    hash[..FINGERPRINT_LEN].to_string()
}

fn canonical_data(request: &BatchRequest) -> String {
    let fields = request
        .hints
        .as_ref()
        .map(|h| h.deduplication_fields.as_slice())
        .unwrap_or(&[]);
    match (&request.data, fields.is_empty()) {
        (serde_json::Value::Object(map), false) => {
            let picked: BTreeMap<&str, &serde_json::Value> = fields
                .iter()
                .filter_map(|f| map.get(f).map(|v| (f.as_str(), v)))
                .collect();
            serde_json::to_string(&picked).unwrap_or_default()
        }
        _ => serde_json::to_string(&request.data).unwrap_or_default(),
    }
}

/// Weighted similarity in `[0, 1]`: endpoint 0.3, method 0.2, zone 0.2, data 0.2, headers 0.1.
///
/// Weights are summed as whole tenths so that a score lands exactly on the documented values.
pub fn similarity(a: &BatchRequest, b: &BatchRequest) -> f64 {
    let mut tenths: u32 = 0;
    if a.endpoint == b.endpoint {
        tenths += 3;
    }
    if a.method == b.method {
        tenths += 2;
    }
    if a.zone == b.zone {
        tenths += 2;
    }
    if a.data == b.data {
        tenths += 2;
    }
    if a.headers.as_ref().filter(|h| !h.is_empty()) == b.headers.as_ref().filter(|h| !h.is_empty()) {
        tenths += 1;
    }
    f64::from(tenths) / 10.0
}

/// Whether two requests may be merged into one synthetic request.
pub fn can_coalesce(a: &BatchRequest, b: &BatchRequest) -> bool {
    a.endpoint == b.endpoint
        && a.method == b.method
        && a.zone == b.zone
        && a.batchable
        && b.batchable
        && a.is_coalesceable()
        && b.is_coalesceable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchHints, HttpMethod};
    use serde_json::json;

    fn req(id: &str, data: serde_json::Value) -> BatchRequest {
        BatchRequest::new(id, "/tickets", HttpMethod::Post, "z1").with_data(data)
    }

    #[test]
    fn test_fingerprint_ignores_id_and_priority() {
        let a = req("a", json!({"summary": "x"})).with_priority(2);
        let b = req("b", json!({"summary": "x"})).with_priority(8);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_changes_with_payload_and_headers() {
        let a = req("a", json!({"summary": "x"}));
        let b = req("b", json!({"summary": "y"}));
        let c = req("c", json!({"summary": "x"})).with_header("x-trace", "1");
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_supplied_fingerprint_wins() {
        let a = req("a", json!(1)).with_fingerprint("k1");
        let b = req("b", json!(2)).with_fingerprint("k1");
        assert_eq!(fingerprint(&a), "k1");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_deduplication_fields_narrow_the_key() {
        let mut hints = BatchHints::new();
        hints.deduplication_fields = vec!["summary".into()];
        let a = req("a", json!({"summary": "x", "note": 1})).with_hints(hints.clone());
        let b = req("b", json!({"summary": "x", "note": 2})).with_hints(hints);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_similarity_weights() {
        let a = req("a", json!({"k": 1}));
        assert!((similarity(&a, &req("b", json!({"k": 1}))) - 1.0).abs() < 1e-9);
        assert!((similarity(&a, &req("b", json!({"k": 2}))) - 0.8).abs() < 1e-9);
        assert!(similarity(&a, &req("b", json!({"k": 2}))) >= 0.8);
        let other = BatchRequest::new("c", "/projects", HttpMethod::Get, "z2").with_data(json!({"k": 2}));
        assert!((similarity(&a, &other) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_can_coalesce_respects_hints_and_batchable() {
        let a = req("a", json!(1));
        assert!(can_coalesce(&a, &req("b", json!(2))));
        assert!(!can_coalesce(&a, &req("b", json!(2)).with_batchable(false)));
        let opted_out = req("b", json!(2)).with_hints(BatchHints::new().with_coalesceable(false));
        assert!(!can_coalesce(&a, &opted_out));
    }
}
