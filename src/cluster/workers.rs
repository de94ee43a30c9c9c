//! Blob work queues and their worker pools
//!
//! The maintenance tasks never touch blob bytes themselves - they enqueue.
//! Two long-lived bounded queues decouple the periodic sweeps from the
//! network: acquire items ("get yourself a replica of this blob") and
//! removal items ("this replica of this blob should go away"). A full queue
//! drops the item with a log line; the next sweep re-derives the work.

use crate::cluster::node::{find_node_map, NodeRecord};
use crate::cluster::{bootstrap, ownership, NodeContext};
use crate::common::metrics::{incr, METRICS};
use crate::common::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const WORK_QUEUE_CAP: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalItem {
    pub oid: String,
    pub node: String,
}

/// Sending half of the node's two blob work queues.
#[derive(Clone)]
pub struct WorkQueues {
    acquire_tx: mpsc::Sender<String>,
    removal_tx: mpsc::Sender<RemovalItem>,
}

/// Receiving half, handed to [`spawn_workers`] (or held by a test).
pub struct WorkReceivers {
    pub acquire_rx: mpsc::Receiver<String>,
    pub removal_rx: mpsc::Receiver<RemovalItem>,
}

impl WorkQueues {
    pub fn new() -> (Self, WorkReceivers) {
        Self::with_capacity(WORK_QUEUE_CAP)
    }

    pub fn with_capacity(cap: usize) -> (Self, WorkReceivers) {
        let (acquire_tx, acquire_rx) = mpsc::channel(cap);
        let (removal_tx, removal_rx) = mpsc::channel(cap);
        (
            Self {
                acquire_tx,
                removal_tx,
            },
            WorkReceivers {
                acquire_rx,
                removal_rx,
            },
        )
    }

    pub fn enqueue_acquire(&self, oid: &str) -> Result<()> {
        self.acquire_tx
            .try_send(oid.to_string())
            .map_err(|_| Error::QueueFull("blob acquire".to_string()))
    }

    pub fn enqueue_removal(&self, oid: &str, node: &str) -> Result<()> {
        self.removal_tx
            .try_send(RemovalItem {
                oid: oid.to_string(),
                node: node.to_string(),
            })
            .map_err(|_| Error::QueueFull("blob removal".to_string()))
    }
}

/// Direct a blob-acquire at `node`: ourselves via the local queue, a peer
/// via its fetch endpoint.
pub async fn queue_blob_acquire(ctx: &NodeContext, node: &NodeRecord, oid: &str) -> Result<()> {
    if node.name == ctx.node_id {
        return ctx.queues.enqueue_acquire(oid);
    }
    let url = node.fetch_url(oid);
    let resp = ctx.http.post(&url).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(Error::RemoteStatus {
            status: resp.status().as_u16(),
            url,
        })
    }
}

/// Start `count` workers on each queue. Workers exit when the queues close.
pub fn spawn_workers(
    ctx: Arc<NodeContext>,
    receivers: WorkReceivers,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let acquire_rx = Arc::new(Mutex::new(receivers.acquire_rx));
    let removal_rx = Arc::new(Mutex::new(receivers.removal_rx));

    let mut handles = Vec::new();
    for _ in 0..count.max(1) {
        handles.push(tokio::spawn(acquire_worker(ctx.clone(), acquire_rx.clone())));
        handles.push(tokio::spawn(removal_worker(ctx.clone(), removal_rx.clone())));
    }
    handles
}

async fn acquire_worker(ctx: Arc<NodeContext>, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
    loop {
        let oid = { rx.lock().await.recv().await };
        let Some(oid) = oid else { return };
        match acquire_one(&ctx, &oid).await {
            Ok(()) => incr(&METRICS.fetches_ok),
            Err(e) => {
                incr(&METRICS.fetch_errors);
                tracing::warn!("Error acquiring {}: {}", oid, e);
            }
        }
    }
}

/// Ensure this node holds a replica of `oid` and the ownership record says
/// so. Tries every listed owner until one fetch succeeds.
pub async fn acquire_one(ctx: &NodeContext, oid: &str) -> Result<()> {
    if ctx.store.contains(oid) {
        let length = ctx.store.blob_size(oid)?;
        return ownership::record_blob_ownership(ctx.meta.as_ref(), &ctx.node_id, oid, length)
            .await;
    }

    let Some(record) = ownership::get_blob_ownership(ctx.meta.as_ref(), oid).await? else {
        return Err(Error::NotFound(format!("no ownership record for {}", oid)));
    };
    let nm = find_node_map(ctx.meta.as_ref()).await?;

    let mut last_err = Error::NotFound(format!("no reachable owner for {}", oid));
    for owner in record.owner_names() {
        if owner == ctx.node_id {
            continue;
        }
        let Some(peer) = nm.get(&owner) else {
            tracing::info!("No nodemap entry for {}", owner);
            continue;
        };
        match bootstrap::fetch_blob(ctx, oid, &peer.blob_url(oid)).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("Error fetching {} from {}: {}", oid, owner, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn removal_worker(ctx: Arc<NodeContext>, rx: Arc<Mutex<mpsc::Receiver<RemovalItem>>>) {
    loop {
        let item = { rx.lock().await.recv().await };
        let Some(item) = item else { return };
        match remove_blob_from_node(&ctx, &item.oid, &item.node).await {
            Ok(()) => incr(&METRICS.removals_ok),
            Err(e) => {
                incr(&METRICS.removal_errors);
                tracing::warn!("Error removing {} from {}: {}", item.oid, item.node, e);
            }
        }
    }
}

/// Delete one replica: locally by dropping the file and our ownership entry,
/// remotely by asking the peer to do the same.
pub async fn remove_blob_from_node(ctx: &NodeContext, oid: &str, node: &str) -> Result<()> {
    if node == ctx.node_id {
        match ctx.store.delete_blob(oid) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                tracing::debug!("Blob {} already gone locally", oid);
            }
            Err(e) => return Err(e),
        }
        ownership::remove_blob_ownership(ctx.meta.as_ref(), oid, node).await?;
    } else {
        let nm = find_node_map(ctx.meta.as_ref()).await?;
        let Some(peer) = nm.get(node) else {
            return Err(Error::NotFound(format!("unknown node {}", node)));
        };
        let url = peer.blob_url(oid);
        let resp = ctx.http.delete(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::RemoteStatus {
                status: resp.status().as_u16(),
                url,
            });
        }
    }
    tracing::info!("Removed blob: {} from node {}", oid, node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInit;
    use crate::meta::{MemMetaStore, MetaStore};
    use crate::store::BlobStore;
    use tempfile::tempdir;

    async fn context() -> (Arc<NodeContext>, WorkReceivers, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path()).unwrap());
        let meta = Arc::new(MemMetaStore::new());
        let (ctx, receivers) = NodeContext::new(
            NodeInit {
                node_id: "n1".to_string(),
                ..NodeInit::default()
            },
            meta,
            store,
            Default::default(),
        )
        .unwrap();
        (ctx, receivers, dir)
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let (queues, _receivers) = WorkQueues::with_capacity(1);
        queues.enqueue_acquire("h1").unwrap();
        assert!(matches!(
            queues.enqueue_acquire("h2"),
            Err(Error::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_already_held_records_ownership() {
        let (ctx, _receivers, _dir) = context().await;
        let (oid, _) = ctx.store.store_bytes(b"local already").await.unwrap();

        acquire_one(&ctx, &oid).await.unwrap();

        let record = ownership::get_blob_ownership(ctx.meta.as_ref(), &oid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_names(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_remove_local_blob_and_ownership() {
        let (ctx, _receivers, _dir) = context().await;
        let (oid, len) = ctx.store.store_bytes(b"to be removed").await.unwrap();
        ownership::record_blob_ownership(ctx.meta.as_ref(), "n1", &oid, len)
            .await
            .unwrap();
        ownership::record_blob_ownership(ctx.meta.as_ref(), "n2", &oid, len)
            .await
            .unwrap();

        remove_blob_from_node(&ctx, &oid, "n1").await.unwrap();

        assert!(!ctx.store.contains(&oid));
        let record = ownership::get_blob_ownership(ctx.meta.as_ref(), &oid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_names(), vec!["n2"]);
    }

    #[tokio::test]
    async fn test_remove_unknown_remote_node() {
        let (ctx, _receivers, _dir) = context().await;
        let err = remove_blob_from_node(&ctx, "abcd", "ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_acquire_without_ownership_record() {
        let (ctx, _receivers, _dir) = context().await;
        // nothing stored locally, nothing in the metadata service
        assert!(ctx.meta.get("/aaaa").await.unwrap().is_none());
        let err = acquire_one(&ctx, "aaaa").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
