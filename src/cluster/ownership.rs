//! Blob ownership records
//!
//! `/<hash>` maps a blob to the nodes currently claiming a replica. Several
//! nodes mutate the same record concurrently (ingest adds an owner, the
//! stale sweep and peer deletes remove one), so every mutation goes through
//! the metadata service's atomic read-modify-write. The observed owner count
//! is the replication factor the maintenance tasks act on.

use crate::common::{now_utc, Result};
use crate::meta::{MetaStore, Mutation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobOwnership {
    pub oid: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub length: u64,

    /// Owner node id → time it registered its replica
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
}

impl BlobOwnership {
    fn new(oid: &str, length: u64) -> Self {
        Self {
            oid: oid.to_string(),
            kind: "blob".to_string(),
            length,
            nodes: BTreeMap::new(),
        }
    }

    pub fn from_doc(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    pub fn owner_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }
}

fn key(oid: &str) -> String {
    format!("/{}", oid)
}

pub async fn get_blob_ownership(
    meta: &dyn MetaStore,
    oid: &str,
) -> Result<Option<BlobOwnership>> {
    match meta.get(&key(oid)).await? {
        Some(doc) => Ok(Some(BlobOwnership::from_doc(doc)?)),
        None => Ok(None),
    }
}

/// Register `node_id` as an owner of `oid`, creating the record if this is
/// the first replica. An unreadable existing document is replaced rather
/// than wedging the writer forever.
pub async fn record_blob_ownership(
    meta: &dyn MetaStore,
    node_id: &str,
    oid: &str,
    length: u64,
) -> Result<()> {
    let stamp = now_utc().to_rfc3339();
    meta.update(&key(oid), &mut |doc| {
        let mut ownership = doc
            .and_then(|d| BlobOwnership::from_doc(d).ok())
            .unwrap_or_else(|| BlobOwnership::new(oid, length));
        ownership.length = length;
        ownership.nodes.insert(node_id.to_string(), stamp.clone());
        Mutation::Set(serde_json::to_value(&ownership).expect("ownership serializes"))
    })
    .await?;
    Ok(())
}

/// Drop `node_id` from `oid`'s owners and return the remaining owner set.
/// The record is deleted once its last owner is gone.
pub async fn remove_blob_ownership(
    meta: &dyn MetaStore,
    oid: &str,
    node_id: &str,
) -> Result<Vec<String>> {
    let mut remaining = Vec::new();
    meta.update(&key(oid), &mut |doc| {
        let Some(doc) = doc else {
            remaining = Vec::new();
            return Mutation::Cancel;
        };
        let mut ownership = match BlobOwnership::from_doc(doc) {
            Ok(o) => o,
            Err(_) => {
                remaining = Vec::new();
                return Mutation::Delete;
            }
        };
        ownership.nodes.remove(node_id);
        remaining = ownership.owner_names();
        if ownership.nodes.is_empty() {
            Mutation::Delete
        } else {
            Mutation::Set(serde_json::to_value(&ownership).expect("ownership serializes"))
        }
    })
    .await?;
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemMetaStore;

    #[tokio::test]
    async fn test_record_and_grow() {
        let meta = MemMetaStore::new();
        record_blob_ownership(&meta, "n1", "abcd", 42).await.unwrap();
        record_blob_ownership(&meta, "n2", "abcd", 42).await.unwrap();

        let ownership = get_blob_ownership(&meta, "abcd").await.unwrap().unwrap();
        assert_eq!(ownership.replica_count(), 2);
        assert_eq!(ownership.owner_names(), vec!["n1", "n2"]);
        assert_eq!(ownership.length, 42);
        assert_eq!(ownership.kind, "blob");
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let meta = MemMetaStore::new();
        record_blob_ownership(&meta, "n1", "abcd", 42).await.unwrap();
        record_blob_ownership(&meta, "n1", "abcd", 42).await.unwrap();

        let ownership = get_blob_ownership(&meta, "abcd").await.unwrap().unwrap();
        assert_eq!(ownership.replica_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_returns_remaining() {
        let meta = MemMetaStore::new();
        record_blob_ownership(&meta, "n1", "abcd", 1).await.unwrap();
        record_blob_ownership(&meta, "n2", "abcd", 1).await.unwrap();

        let remaining = remove_blob_ownership(&meta, "abcd", "n1").await.unwrap();
        assert_eq!(remaining, vec!["n2"]);
    }

    #[tokio::test]
    async fn test_last_owner_deletes_record() {
        let meta = MemMetaStore::new();
        record_blob_ownership(&meta, "n1", "abcd", 1).await.unwrap();

        let remaining = remove_blob_ownership(&meta, "abcd", "n1").await.unwrap();
        assert!(remaining.is_empty());
        assert!(meta.get("/abcd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_from_absent_record() {
        let meta = MemMetaStore::new();
        let remaining = remove_blob_ownership(&meta, "missing", "n1").await.unwrap();
        assert!(remaining.is_empty());
    }
}
