//! In-memory metadata store
//!
//! A complete single-process implementation of [`MetaStore`]: real TTL
//! expiry, atomic read-modify-write under one lock, and view rows computed
//! on demand from the stored documents. Tests lean on it heavily (the lease
//! semantics are the real thing, not a mock), and a single-node deployment
//! can run on it unchanged.
//!
//! View generation dispatches on each document's `type` field:
//! - `"node"` rows feed the `nodes` view,
//! - `"blob"` (ownership records) feed `node_blobs`, `repcounts`, and the
//!   blob half of `file_blobs`,
//! - `"file"` feeds the file half of `file_blobs`.

use crate::common::{Error, Result};
use crate::meta::view::{cmp_keys, ViewError, ViewParams, ViewResult, ViewRow};
use crate::meta::{MetaStore, Mutation, UpdateFn};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Doc {
    value: Value,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Doc>,
    view_errors: Vec<ViewError>,
}

#[derive(Default)]
pub struct MemMetaStore {
    inner: Mutex<Inner>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent view query report these errors (rows are still
    /// produced). Pass an empty vec to clear.
    pub fn set_view_errors(&self, errors: Vec<ViewError>) {
        self.inner.lock().unwrap().view_errors = errors;
    }

    /// Number of live (unexpired) documents.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        inner.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys, sorted. Handy for state assertions in tests.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        let mut keys: Vec<String> = inner.docs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn purge_expired(inner: &mut Inner) {
    let now = Instant::now();
    inner
        .docs
        .retain(|_, doc| doc.expires.map_or(true, |at| at > now));
}

fn build_rows(docs: &HashMap<String, Doc>, name: &str, include_docs: bool) -> Vec<ViewRow> {
    let mut rows = Vec::new();

    for (key, doc) in docs {
        let kind = doc.value.get("type").and_then(Value::as_str).unwrap_or("");
        match (name, kind) {
            ("nodes", "node") => {
                rows.push(row(
                    key,
                    json!(key.trim_start_matches('/')),
                    doc.value.get("time").cloned().unwrap_or(Value::Null),
                    include_docs.then(|| doc.value.clone()),
                ));
            }
            ("node_blobs", "blob") => {
                for owner in owner_names(&doc.value) {
                    rows.push(row(key, json!(owner), Value::Null, None));
                }
            }
            ("file_blobs", "blob") => {
                let oid = key.trim_start_matches('/');
                for owner in owner_names(&doc.value) {
                    rows.push(row(key, json!([oid, "blob", owner]), Value::Null, None));
                }
            }
            ("file_blobs", "file") => {
                let file_id = key.trim_start_matches('/');
                if let Some(blobs) = doc.value.get("blobs").and_then(Value::as_array) {
                    for oid in blobs.iter().filter_map(Value::as_str) {
                        rows.push(row(key, json!([oid, "file", file_id]), Value::Null, None));
                    }
                }
            }
            ("repcounts", "blob") => {
                rows.push(row(
                    key,
                    json!(owner_names(&doc.value).len()),
                    Value::Null,
                    include_docs.then(|| doc.value.clone()),
                ));
            }
            _ => {}
        }
    }

    rows
}

fn row(id: &str, key: Value, value: Value, doc: Option<Value>) -> ViewRow {
    ViewRow {
        id: id.to_string(),
        key,
        value,
        doc,
    }
}

fn owner_names(doc: &Value) -> Vec<String> {
    doc.get("nodes")
        .and_then(Value::as_object)
        .map(|nodes| nodes.keys().cloned().collect())
        .unwrap_or_default()
}

fn apply_params(mut rows: Vec<ViewRow>, params: &ViewParams) -> Vec<ViewRow> {
    if let Some(key) = &params.key {
        rows.retain(|r| cmp_keys(&r.key, key) == Ordering::Equal);
    }
    if let Some(start) = &params.startkey {
        rows.retain(|r| cmp_keys(&r.key, start) != Ordering::Less);
    }
    if let Some(end) = &params.endkey {
        rows.retain(|r| cmp_keys(&r.key, end) != Ordering::Greater);
    }

    rows.sort_by(|a, b| cmp_keys(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
    if params.descending {
        rows.reverse();
    }
    if let Some(limit) = params.limit {
        rows.truncate(limit);
    }
    rows
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn add(&self, key: &str, doc: Value, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        if inner.docs.contains_key(key) {
            return Err(Error::KeyExists(key.to_string()));
        }
        inner.docs.insert(
            key.to_string(),
            Doc {
                value: doc,
                expires: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set(&self, key: &str, doc: Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        inner.docs.insert(
            key.to_string(),
            Doc {
                value: doc,
                expires: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        Ok(inner.docs.get(key).map(|doc| doc.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.docs.remove(key);
        Ok(())
    }

    async fn update(&self, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        let current = inner.docs.get(key).map(|doc| doc.value.clone());
        match f(current.clone()) {
            Mutation::Set(doc) => {
                inner.docs.insert(
                    key.to_string(),
                    Doc {
                        value: doc.clone(),
                        expires: None,
                    },
                );
                Ok(Some(doc))
            }
            Mutation::Delete => {
                inner.docs.remove(key);
                Ok(None)
            }
            Mutation::Cancel => Ok(current),
        }
    }

    async fn view(&self, _design: &str, name: &str, params: &ViewParams) -> Result<ViewResult> {
        let mut inner = self.inner.lock().unwrap();
        purge_expired(&mut inner);
        let rows = apply_params(build_rows(&inner.docs, name, params.include_docs), params);
        Ok(ViewResult {
            rows,
            errors: inner.view_errors.clone(),
        })
    }
}
