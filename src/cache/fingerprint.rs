//! Request fingerprints used as cache keys.
//!
//! A fingerprint is `{service}:{operation}:{sha256}` where the hash covers
//! the canonical JSON array `[service, operation, payload]`: object keys
//! sorted at every level, no whitespace. Identical requests collide
//! regardless of field order; the readable prefix only serves invalidation.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic cache key for one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: String,
    service_len: usize,
}

impl Fingerprint {
    pub fn new(service: &str, operation: &str, payload: &Value) -> Self {
        let mut canonical = String::from("[");
        write_string(service, &mut canonical);
        canonical.push(',');
        write_string(operation, &mut canonical);
        canonical.push(',');
        write_canonical(payload, &mut canonical);
        canonical.push(']');
        let digest = Sha256::digest(canonical.as_bytes());

        Self {
            key: format!("{}:{}:{}", service, operation, hex::encode(digest)),
            service_len: service.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Service the request was addressed to.
    pub fn service(&self) -> &str {
        &self.key[..self.service_len]
    }

    /// Prefix matching every fingerprint for a service.
    pub fn service_prefix(service: &str) -> String {
        format!("{}:", service)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_matter() {
        let a = Fingerprint::new(
            "coingecko",
            "price",
            &json!({"ids": "bitcoin", "vs": {"a": 1, "b": [1, 2]}}),
        );
        let b = Fingerprint::new(
            "coingecko",
            "price",
            &json!({"vs": {"b": [1, 2], "a": 1}, "ids": "bitcoin"}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_requests_differ() {
        let base = Fingerprint::new("coingecko", "price", &json!({"ids": "bitcoin"}));
        assert_ne!(base, Fingerprint::new("coingecko", "price", &json!({"ids": "ethereum"})));
        assert_ne!(base, Fingerprint::new("coingecko", "markets", &json!({"ids": "bitcoin"})));
        assert_ne!(base, Fingerprint::new("github", "price", &json!({"ids": "bitcoin"})));
        // Array order is significant.
        assert_ne!(
            Fingerprint::new("x", "op", &json!([1, 2])),
            Fingerprint::new("x", "op", &json!([2, 1]))
        );
    }

    #[test]
    fn colons_in_names_do_not_collide() {
        let payload = json!({"ids": "bitcoin"});
        let a = Fingerprint::new("a:b", "c", &payload);
        let b = Fingerprint::new("a", "b:c", &payload);
        assert_ne!(a, b);
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn key_layout() {
        let fp = Fingerprint::new("llm", "complete", &json!({"prompt": "hi"}));
        assert_eq!(fp.service(), "llm");
        assert!(fp.as_str().starts_with(&Fingerprint::service_prefix("llm")));
        let hash = fp.as_str().rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
