//! Stable cache keys for units of work
//!
//! A [`Fingerprint`] is `"{tool}:{sha256}"` where the digest covers the
//! canonical JSON form of the parameters: object keys sorted at every level,
//! no insignificant whitespace. Two descriptors that differ only in key order
//! therefore share a fingerprint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// What is being asked for: a tool and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

impl WorkDescriptor {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            params,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.tool, &self.params)
    }
}

/// Deterministic cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a tool invocation
    pub fn of(tool: &str, params: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        Fingerprint(format!("{}:{}", normalize_tool(tool), hex::encode(digest)))
    }

    /// Key for a value that is not tied to a tool invocation
    pub fn named(namespace: &str, name: &str) -> Self {
        Fingerprint(format!("{}:{}", normalize_tool(namespace), name))
    }

    /// Rebuild a key from its string form (e.g. a disk file name)
    pub fn parse(raw: &str) -> Option<Self> {
        let (tool, rest) = raw.split_once(':')?;
        (!tool.is_empty() && !rest.is_empty()).then(|| Fingerprint(raw.to_string()))
    }

    /// Tool prefix, as used by per-tool TTLs and invalidation
    pub fn tool(&self) -> &str {
        self.0.split_once(':').map(|(tool, _)| tool).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase, trimmed, and free of the `:` separator
pub(crate) fn normalize_tool(tool: &str) -> String {
    let normalized: String = tool
        .trim()
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    if normalized.is_empty() {
        "_".to_string()
    } else {
        normalized
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(value, out);
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
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display for scalars is compact JSON
    out.push_str(&value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    #[test]
    fn test_key_order_does_not_matter() {
        let a = Fingerprint::of("nmap", &json!({"target": "10.0.0.1", "ports": "1-1000"}));
        let b = Fingerprint::of("nmap", &json!({"ports": "1-1000", "target": "10.0.0.1"}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_nested_objects_are_canonical() {
        let a = json!({"opts": {"b": 1, "a": [{"y": 2, "x": 1}]}});
        let b = json!({"opts": {"a": [{"x": 1, "y": 2}], "b": 1}});
        assert_eq!(Fingerprint::of("t", &a), Fingerprint::of("t", &b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = Fingerprint::of("t", &json!({"ports": [80, 443]}));
        let b = Fingerprint::of("t", &json!({"ports": [443, 80]}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_tool_prefix_is_normalized() {
        let fp = Fingerprint::of("  Nuclei ", &json!({}));
        assert_eq!(fp.tool(), "nuclei");
        assert!(fp.as_str().starts_with("nuclei:"));
        // "nuclei:" + 64 hex chars
        assert_eq!(fp.len(), 7 + 64);

        assert_eq!(Fingerprint::of("a:b", &json!(null)).tool(), "a_b");
    }

    #[test]
    fn test_different_tools_never_collide() {
        let params = json!({"target": "example.com"});
        assert_ne!(Fingerprint::of("nmap", &params), Fingerprint::of("amass", &params));
    }

    #[test]
    fn test_parse_and_named() {
        let fp = Fingerprint::named("warmup", "top-ports");
        assert_eq!(fp.as_str(), "warmup:top-ports");
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
        assert_eq!(Fingerprint::parse("no-separator"), None);
        assert_eq!(Fingerprint::parse(":empty-tool"), None);
    }

    #[test]
    fn test_descriptor_fingerprint() {
        let descriptor = WorkDescriptor::new("gobuster", json!({"url": "http://x"}));
        assert_eq!(
            descriptor.fingerprint(),
            Fingerprint::of("gobuster", &json!({"url": "http://x"}))
        );
    }

    proptest! {
        #[test]
        fn prop_insertion_order_is_irrelevant(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let mut forward = Map::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut reverse = Map::new();
            for (k, v) in entries.iter().rev() {
                reverse.insert(k.clone(), json!(v));
            }

            prop_assert_eq!(
                Fingerprint::of("tool", &Value::Object(forward)),
                Fingerprint::of("tool", &Value::Object(reverse))
            );
        }
    }
}
