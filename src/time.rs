//! Timestamp parsing, monotonic comparison, id generation and stable
//! hashing shared by the transport's auth handshake, the REST signer, and
//! the per-entity dedup/resync logic in the engines.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Parses an exchange ISO-8601 timestamp (fractional seconds optional)
/// into a UTC instant.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `true` if `candidate` is at least as new as `baseline` (equal timestamps
/// count as "not older", per the wallet/position dedup rules which allow
/// equal-timestamp overlays but reject strictly older ones).
pub fn is_same_or_newer(candidate: DateTime<Utc>, baseline: DateTime<Utc>) -> bool {
    candidate >= baseline
}

/// Generates a `clOrdId`-suitable idempotency key.
pub fn new_cl_ord_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in whole milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Computes the `expires` value used by both the WS auth handshake and
/// REST signing: whole seconds since epoch, offset by `skew_secs` to give
/// the exchange room for clock drift.
pub fn skewed_expires(skew_secs: i64) -> i64 {
    now_ms() / 1000 + skew_secs
}

/// A stable hash of a canonicalized JSON value, used to detect "no
/// semantic change" between two snapshots regardless of key order.
pub fn stable_hash(value: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value(value, &mut hasher);
    hasher.finish()
}

fn hash_value(value: &serde_json::Value, hasher: &mut impl Hasher) {
    match value {
        serde_json::Value::Null => 0u8.hash(hasher),
        serde_json::Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        serde_json::Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        serde_json::Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        serde_json::Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        serde_json::Value::Object(map) => {
            5u8.hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fractional_and_whole_second_timestamps() {
        assert!(parse_iso("2024-01-01T00:00:00Z").is_some());
        assert!(parse_iso("2024-01-01T00:00:00.123Z").is_some());
        assert!(parse_iso("not-a-timestamp").is_none());
    }

    #[test]
    fn equal_timestamps_count_as_same_or_newer() {
        let t = parse_iso("2024-01-01T00:00:00Z").unwrap();
        assert!(is_same_or_newer(t, t));
    }

    #[test]
    fn older_timestamp_is_rejected() {
        let older = parse_iso("2024-01-01T00:00:00Z").unwrap();
        let newer = parse_iso("2024-01-01T00:00:01Z").unwrap();
        assert!(!is_same_or_newer(older, newer));
        assert!(is_same_or_newer(newer, older));
    }

    #[test]
    fn stable_hash_ignores_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(stable_hash(&a), stable_hash(&b));
    }

    #[test]
    fn stable_hash_distinguishes_different_values() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(stable_hash(&a), stable_hash(&b));
    }

    #[test]
    fn cl_ord_ids_are_unique() {
        assert_ne!(new_cl_ord_id(), new_cl_ord_id());
    }
}
