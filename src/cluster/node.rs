//! Node records and peer lookups
//!
//! Every node publishes a [`NodeRecord`] under `/<nodeId>` from its
//! heartbeat; peers read the full set through the `nodes` view. A record is
//! only ever written by its owning node and only ever deleted by the stale
//! sweep, once the dead node's blobs have been rehomed.

use crate::common::{Error, Result};
use crate::meta::{MetaStore, ViewParams, DESIGN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identity, derived from the record's key; never serialized.
    #[serde(skip)]
    pub name: String,

    /// Local IP observed by the heartbeat's outbound probe
    #[serde(default)]
    pub addr: String,

    /// host:port of the node's blob endpoint
    #[serde(default)]
    pub bindaddr: String,

    #[serde(rename = "type")]
    pub kind: String,

    /// Last heartbeat
    pub time: DateTime<Utc>,

    #[serde(default)]
    pub used: u64,

    #[serde(default)]
    pub free: u64,
}

impl NodeRecord {
    pub fn from_doc(name: &str, doc: Value) -> Result<Self> {
        let mut record: NodeRecord = serde_json::from_value(doc)
            .map_err(|e| Error::BadRecord(format!("node record {}: {}", name, e)))?;
        record.name = name.to_string();
        Ok(record)
    }

    /// Reachable host:port. A wildcard bind falls back to the heartbeat's
    /// observed address.
    pub fn address(&self) -> String {
        if let Some(port) = self.bindaddr.strip_prefix(':') {
            return format!("{}:{}", self.addr, port);
        }
        if let Some(port) = self.bindaddr.strip_prefix("0.0.0.0:") {
            return format!("{}:{}", self.addr, port);
        }
        self.bindaddr.clone()
    }

    pub fn blob_url(&self, oid: &str) -> String {
        format!("http://{}/.cbfs/blob/{}", self.address(), oid)
    }

    pub fn fetch_url(&self, oid: &str) -> String {
        format!("http://{}/.cbfs/fetch/{}", self.address(), oid)
    }

    /// Time since the last heartbeat, zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.time).to_std().unwrap_or_default()
    }
}

/// All known nodes, in view (name) order.
#[derive(Debug, Clone, Default)]
pub struct NodeList(pub Vec<NodeRecord>);

impl NodeList {
    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.0.iter()
    }

    pub fn named(&self, name: &str) -> Option<&NodeRecord> {
        self.0.iter().find(|n| n.name == name)
    }

    /// Peers eligible to take on a fresh replica: not already an owner, not
    /// in the exclude list.
    pub fn candidates_for(&self, owners: &[String], exclude: &[&str]) -> Vec<&NodeRecord> {
        self.0
            .iter()
            .filter(|n| !owners.contains(&n.name) && !exclude.contains(&n.name.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Every node currently registered, fresh.
pub async fn find_all_nodes(meta: &dyn MetaStore) -> Result<NodeList> {
    let params = ViewParams::default().include_docs().fresh();
    let res = meta.view(DESIGN, "nodes", &params).await?;
    res.check_errors()?;

    let mut nodes = Vec::with_capacity(res.rows.len());
    for row in res.rows {
        let name = &row.id[1..];
        let Some(doc) = row.doc else {
            tracing::warn!("nodes view row for {} carried no document", name);
            continue;
        };
        match NodeRecord::from_doc(name, doc) {
            Ok(record) => nodes.push(record),
            Err(e) => tracing::warn!("Skipping unreadable node record: {}", e),
        }
    }
    Ok(NodeList(nodes))
}

pub async fn find_node_map(meta: &dyn MetaStore) -> Result<HashMap<String, NodeRecord>> {
    let nodes = find_all_nodes(meta).await?;
    Ok(nodes.0.into_iter().map(|n| (n.name.clone(), n)).collect())
}

/// Every node except ourselves.
pub async fn find_remote_nodes(meta: &dyn MetaStore, self_id: &str) -> Result<NodeList> {
    let mut nodes = find_all_nodes(meta).await?;
    nodes.0.retain(|n| n.name != self_id);
    Ok(nodes)
}
