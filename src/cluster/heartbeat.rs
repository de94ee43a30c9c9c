//! Liveness loops: heartbeat and config refresher
//!
//! The heartbeat is a full overwrite of this node's record every tick; no
//! compare-and-swap, because the record has exactly one writer. Losing a few
//! heartbeats is harmless. Losing them past the stale limit is how a node
//! leaves the cluster.

use crate::cluster::NodeContext;
use crate::common::{now_utc, ClusterConfig, ConfigHandle, Error, Result, CONFIG_KEY};
use crate::meta::MetaStore;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(60);
const ADDR_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The IP the metadata service would see us connect from. We learn it by
/// opening (and immediately closing) an outbound socket.
async fn detect_local_addr(host: &str) -> Option<String> {
    let connect = tokio::net::TcpStream::connect(host);
    let stream = tokio::time::timeout(ADDR_PROBE_TIMEOUT, connect)
        .await
        .ok()?
        .ok()?;
    Some(stream.local_addr().ok()?.ip().to_string())
}

/// Publish one heartbeat record.
pub async fn publish_heartbeat(ctx: &NodeContext) -> Result<()> {
    let addr = match &ctx.meta_host {
        Some(host) => detect_local_addr(host).await.unwrap_or_default(),
        None => String::new(),
    };

    let free = match ctx.store.free_space() {
        Ok(mut free) => {
            if ctx.max_storage > 0 && free > ctx.max_storage {
                free = ctx.max_storage;
            }
            free
        }
        Err(Error::NoFsFree) => 0,
        Err(e) => {
            tracing::error!("Error getting filesystem info: {}", e);
            0
        }
    };

    let record = crate::cluster::node::NodeRecord {
        name: ctx.node_id.clone(),
        addr,
        bindaddr: ctx.bind_addr.clone(),
        kind: "node".to_string(),
        time: now_utc(),
        used: ctx.store.space_used(),
        free,
    };

    ctx.meta
        .set(&format!("/{}", ctx.node_id), serde_json::to_value(&record)?)
        .await
}

pub async fn run_heartbeat(ctx: Arc<NodeContext>) {
    loop {
        if let Err(e) = publish_heartbeat(&ctx).await {
            tracing::error!("Failed to record a heartbeat: {}", e);
        }
        tokio::time::sleep(ctx.config.get().heartbeat_freq()).await;
    }
}

/// Pull the tunables document and swap the in-memory snapshot. A missing
/// document keeps the current config.
pub async fn update_config(meta: &dyn MetaStore, handle: &ConfigHandle) -> Result<()> {
    let Some(doc) = meta.get(CONFIG_KEY).await? else {
        return Ok(());
    };
    let config: ClusterConfig = serde_json::from_value(doc)?;
    handle.replace(config);
    Ok(())
}

pub async fn run_config_refresher(ctx: Arc<NodeContext>) {
    loop {
        tokio::time::sleep(CONFIG_POLL_INTERVAL).await;
        if let Err(e) = update_config(ctx.meta.as_ref(), &ctx.config).await {
            tracing::error!("Error updating config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemMetaStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_config_swaps_snapshot() {
        let meta = MemMetaStore::new();
        let handle = ConfigHandle::default();

        meta.set(CONFIG_KEY, json!({"min_replicas": 4})).await.unwrap();
        update_config(&meta, &handle).await.unwrap();
        assert_eq!(handle.get().min_replicas, 4);
    }

    #[tokio::test]
    async fn test_update_config_missing_doc_keeps_current() {
        let meta = MemMetaStore::new();
        let handle = ConfigHandle::default();

        update_config(&meta, &handle).await.unwrap();
        assert_eq!(handle.get().min_replicas, 2);
    }

    #[tokio::test]
    async fn test_update_config_bad_doc_is_an_error() {
        let meta = MemMetaStore::new();
        let handle = ConfigHandle::default();

        meta.set(CONFIG_KEY, json!({"min_replicas": "many"}))
            .await
            .unwrap();
        assert!(update_config(&meta, &handle).await.is_err());
        // previous configuration retained
        assert_eq!(handle.get().min_replicas, 2);
    }
}
