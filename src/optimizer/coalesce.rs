//! Merging of similar requests into synthetic ones.

use super::fingerprint::{can_coalesce, similarity};
use crate::types::{epoch_millis, BatchRequest};
use serde_json::{json, Value};

/// Group requests whose similarity to a group leader reaches `threshold` and merge each
/// group of two or more into one synthetic request. Returns the new list and the number
/// of source requests absorbed (group size minus one, summed).
pub(crate) fn coalesce(requests: Vec<BatchRequest>, threshold: f64) -> (Vec<BatchRequest>, usize) {
    let mut taken = vec![false; requests.len()];
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for i in 0..requests.len() {
        if taken[i] {
            continue;
        }
        taken[i] = true;
        let mut group = vec![i];
        for j in (i + 1)..requests.len() {
            if taken[j] {
                continue;
            }
            if can_coalesce(&requests[i], &requests[j])
                && similarity(&requests[i], &requests[j]) >= threshold
            {
                taken[j] = true;
                group.push(j);
            }
        }
        groups.push(group);
    }

    let mut slots: Vec<Option<BatchRequest>> = requests.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(groups.len());
    let mut absorbed = 0;
    for group in groups {
        let mut members = group.iter().filter_map(|&i| slots[i].take());
        let Some(main) = members.next() else {
            continue;
        };
        let rest: Vec<BatchRequest> = members.collect();
        if rest.is_empty() {
            out.push(main);
        } else {
            absorbed += rest.len();
            out.push(merge(main, rest));
        }
    }
    (out, absorbed)
}

fn merge(main: BatchRequest, rest: Vec<BatchRequest>) -> BatchRequest {
    let sources: Vec<Value> = std::iter::once(&main)
        .chain(rest.iter())
        .map(|r| Value::String(r.id.clone()))
        .collect();
    let priorities: Vec<Value> = std::iter::once(&main)
        .chain(rest.iter())
        .map(|r| json!(r.priority))
        .collect();
    let priority = rest.iter().map(|r| r.priority).fold(main.priority, u8::max);
    let created_at = rest.iter().map(|r| r.created_at).fold(main.created_at, std::cmp::min);

    let data = match main.data.clone() {
        Value::Array(mut items) => {
            for r in &rest {
                match &r.data {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    other => items.push(other.clone()),
                }
            }
            Value::Array(items)
        }
        Value::Object(mut map) => {
            for r in &rest {
                if let Value::Object(other) = &r.data {
                    for (k, v) in other {
                        map.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(map)
        }
        other => other,
    };

    let mut hints = main.hints.clone().unwrap_or_default();
    hints.coalesceable = Some(false);

    let mut merged = BatchRequest {
        id: format!("coalesced_{}_{}", main.id, epoch_millis()),
        priority,
        data,
        created_at,
        hints: Some(hints),
        fingerprint: None,
        ..main
    };
    merged.metadata.insert("coalesced_from".to_string(), Value::Array(sources));
    merged
        .metadata
        .insert("original_priorities".to_string(), Value::Array(priorities));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;

    fn req(id: &str, p: u8, data: Value) -> BatchRequest {
        BatchRequest::new(id, "/tickets", HttpMethod::Post, "z1")
            .with_priority(p)
            .with_data(data)
    }

    #[test]
    fn test_array_payloads_concatenate() {
        let (out, absorbed) = coalesce(
            vec![req("a", 3, json!([1])), req("b", 7, json!([2, 3])), req("c", 5, json!([4]))],
            0.8,
        );
        assert_eq!(absorbed, 2);
        assert_eq!(out.len(), 1);
        let merged = &out[0];
        assert!(merged.id.starts_with("coalesced_a_"));
        assert_eq!(merged.priority, 7);
        assert_eq!(merged.data, json!([1, 2, 3, 4]));
        assert_eq!(merged.metadata["coalesced_from"], json!(["a", "b", "c"]));
        assert_eq!(merged.metadata["original_priorities"], json!([3, 7, 5]));
        assert!(!merged.is_coalesceable());
    }

    #[test]
    fn test_object_payloads_shallow_merge() {
        let (out, _) = coalesce(
            vec![req("a", 5, json!({"x": 1, "y": 1})), req("b", 5, json!({"y": 2, "z": 3}))],
            0.8,
        );
        assert_eq!(out[0].data, json!({"x": 1, "y": 2, "z": 3}));
    }

    #[test]
    fn test_scalar_main_payload_is_kept() {
        let (out, _) = coalesce(vec![req("a", 5, json!("keep")), req("b", 5, json!("drop"))], 0.8);
        assert_eq!(out[0].data, json!("keep"));
    }

    #[test]
    fn test_below_threshold_is_untouched() {
        let (out, absorbed) = coalesce(vec![req("a", 5, json!(1)), req("b", 5, json!(2))], 0.9);
        assert_eq!(absorbed, 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
    }
}
