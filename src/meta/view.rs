//! View query types
//!
//! Views are secondary indices maintained by the metadata service. A query
//! returns a finite row sequence plus a (usually empty) list of per-shard
//! errors; a non-empty error list means the index could not be read in full
//! and callers must not act on the partial rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Recognized view query parameters.
#[derive(Debug, Clone, Default)]
pub struct ViewParams {
    /// Exact key match
    pub key: Option<Value>,
    /// Inclusive range start (applied in ascending key order)
    pub startkey: Option<Value>,
    /// Inclusive range end
    pub endkey: Option<Value>,
    /// Maximum rows returned
    pub limit: Option<usize>,
    /// Emit rows in descending key order
    pub descending: bool,
    /// Run the reduce step; the node always queries map rows
    pub reduce: Option<bool>,
    /// Attach the source document to each row
    pub include_docs: bool,
    /// `Some(false)` forces the index current before responding
    pub stale: Option<bool>,
}

impl ViewParams {
    pub fn key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn range(mut self, startkey: Value, endkey: Value) -> Self {
        self.startkey = Some(startkey);
        self.endkey = Some(endkey);
        self
    }

    pub fn startkey(mut self, startkey: Value) -> Self {
        self.startkey = Some(startkey);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn no_reduce(mut self) -> Self {
        self.reduce = Some(false);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub fn fresh(mut self) -> Self {
        self.stale = Some(false);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRow {
    /// Document id, carrying the leading `/` of the key layout
    pub id: String,
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewError {
    pub from: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewResult {
    #[serde(default)]
    pub rows: Vec<ViewRow>,
    #[serde(default)]
    pub errors: Vec<ViewError>,
}

impl ViewResult {
    /// Collapse a non-empty error list into a single fatal error.
    pub fn check_errors(&self) -> crate::common::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let summary = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.from, e.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(crate::common::Error::ViewErrors(summary))
    }
}

/// Total order over view keys: null < bool < number < string < array.
///
/// String comparison is bytewise, which is what makes `["h", "blob", ..]`
/// sort before `["h", "file", ..]` and the descending orphan scan see file
/// rows first within one blob hash.
pub fn cmp_keys(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                match cmp_keys(xe, ye) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_ranks() {
        assert_eq!(cmp_keys(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(cmp_keys(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(cmp_keys(&json!(99), &json!("a")), Ordering::Less);
        assert_eq!(cmp_keys(&json!("z"), &json!([])), Ordering::Less);
    }

    #[test]
    fn test_array_elementwise() {
        assert_eq!(
            cmp_keys(&json!(["h1", "blob"]), &json!(["h1", "file"])),
            Ordering::Less
        );
        assert_eq!(
            cmp_keys(&json!(["h1", "file"]), &json!(["h2", "blob"])),
            Ordering::Less
        );
        // shorter array with equal prefix sorts first
        assert_eq!(
            cmp_keys(&json!(["h1"]), &json!(["h1", "x"])),
            Ordering::Less
        );
    }

    #[test]
    fn test_check_errors() {
        let ok = ViewResult::default();
        assert!(ok.check_errors().is_ok());

        let bad = ViewResult {
            rows: vec![],
            errors: vec![ViewError {
                from: "shard-3".into(),
                reason: "timeout".into(),
            }],
        };
        let err = bad.check_errors().unwrap_err();
        assert!(err.to_string().contains("shard-3"));
    }
}
