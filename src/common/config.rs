//! Cluster-wide runtime tunables
//!
//! The tunables live in the metadata service under [`CONFIG_KEY`] so that an
//! operator can retune a running cluster. Every node polls the document and
//! swaps its in-memory snapshot; loops pick up new values at their next tick.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Metadata key the tunables document is stored under.
pub const CONFIG_KEY: &str = "/@globalConfig";

/// Cluster configuration. All fields have defaults so a partial document
/// (or a missing one) still yields a usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Heartbeat interval
    #[serde(default = "default_heartbeat_freq")]
    pub heartbeat_freq_secs: u64,

    /// How often to look for nodes that stopped heartbeating
    #[serde(default = "default_stale_node_check_freq")]
    pub stale_node_check_freq_secs: u64,

    /// Age past which a node counts as stale
    #[serde(default = "default_stale_node_limit")]
    pub stale_node_limit_secs: u64,

    /// Orphan-blob garbage collection interval
    #[serde(default = "default_gc_freq")]
    pub gc_freq_secs: u64,

    /// View rows scanned per GC pass
    #[serde(default = "default_gc_limit")]
    pub gc_limit: usize,

    /// Under-replication repair interval
    #[serde(default = "default_under_replica_check_freq")]
    pub under_replica_check_freq_secs: u64,

    /// Over-replication prune interval
    #[serde(default = "default_over_replica_check_freq")]
    pub over_replica_check_freq_secs: u64,

    /// Minimum desired replicas per blob
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Maximum desired replicas per blob
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,

    /// Blobs processed per dead-node cleanup invocation
    #[serde(default = "default_node_clean_count")]
    pub node_clean_count: usize,

    /// Local-state reconciliation interval; zero disables the loop
    #[serde(default = "default_reconcile_freq")]
    pub reconcile_freq_secs: u64,

    /// Blobs examined per repair/prune pass
    #[serde(default = "default_repair_batch")]
    pub repair_batch: usize,
}

fn default_heartbeat_freq() -> u64 {
    5
}
fn default_stale_node_check_freq() -> u64 {
    60
}
fn default_stale_node_limit() -> u64 {
    300
}
fn default_gc_freq() -> u64 {
    300
}
fn default_gc_limit() -> usize {
    5000
}
fn default_under_replica_check_freq() -> u64 {
    300
}
fn default_over_replica_check_freq() -> u64 {
    600
}
fn default_min_replicas() -> usize {
    2
}
fn default_max_replicas() -> usize {
    5
}
fn default_node_clean_count() -> usize {
    1000
}
fn default_reconcile_freq() -> u64 {
    86400
}
fn default_repair_batch() -> usize {
    1000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl ClusterConfig {
    pub fn heartbeat_freq(&self) -> Duration {
        Duration::from_secs(self.heartbeat_freq_secs)
    }

    pub fn stale_node_check_freq(&self) -> Duration {
        Duration::from_secs(self.stale_node_check_freq_secs)
    }

    pub fn stale_node_limit(&self) -> Duration {
        Duration::from_secs(self.stale_node_limit_secs)
    }

    pub fn gc_freq(&self) -> Duration {
        Duration::from_secs(self.gc_freq_secs)
    }

    pub fn under_replica_check_freq(&self) -> Duration {
        Duration::from_secs(self.under_replica_check_freq_secs)
    }

    pub fn over_replica_check_freq(&self) -> Duration {
        Duration::from_secs(self.over_replica_check_freq_secs)
    }

    pub fn reconcile_freq(&self) -> Duration {
        Duration::from_secs(self.reconcile_freq_secs)
    }
}

/// Shared handle to the current config snapshot.
///
/// The refresher replaces the snapshot; everyone else clones the `Arc` at the
/// top of a tick. A reader that raced a replace sees at most one stale period.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ClusterConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<ClusterConfig> {
        self.inner.read().unwrap().clone()
    }

    /// Swap in a fresh snapshot.
    pub fn replace(&self, config: ClusterConfig) {
        *self.inner.write().unwrap() = Arc::new(config);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.heartbeat_freq(), Duration::from_secs(5));
        assert_eq!(config.min_replicas, 2);
        assert_eq!(config.max_replicas, 5);
        assert_eq!(config.gc_limit, 5000);
    }

    #[test]
    fn test_partial_document() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"min_replicas": 3, "gc_freq_secs": 60}"#).unwrap();
        assert_eq!(config.min_replicas, 3);
        assert_eq!(config.gc_freq(), Duration::from_secs(60));
        // untouched fields keep their defaults
        assert_eq!(config.max_replicas, 5);
        assert_eq!(config.node_clean_count, 1000);
    }

    #[test]
    fn test_handle_swap() {
        let handle = ConfigHandle::default();
        assert_eq!(handle.get().min_replicas, 2);

        let mut updated = ClusterConfig::default();
        updated.min_replicas = 4;
        handle.replace(updated);
        assert_eq!(handle.get().min_replicas, 4);
    }

    #[test]
    fn test_zero_reconcile_disables() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"reconcile_freq_secs": 0}"#).unwrap();
        assert!(config.reconcile_freq().is_zero());
    }
}
