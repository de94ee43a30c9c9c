//! Reconciliation and startup replication pull
//!
//! The reconcile loop keeps two directions honest: `reconcile` re-asserts
//! ownership of every blob actually on local disk, and `grab_some_data`
//! pulls in under-replicated blobs from peers. The pull runs through a
//! bounded channel drained by a fixed worker pool, so a node joining a busy
//! cluster ramps up without flooding its peers or its own memory.

use crate::cluster::node::{find_remote_nodes, NodeRecord};
use crate::cluster::ownership::{record_blob_ownership, BlobOwnership};
use crate::cluster::NodeContext;
use crate::common::metrics::{incr, METRICS};
use crate::common::{Error, Result};
use crate::meta::{MetaStore, ViewParams, DESIGN};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const FETCH_CHANNEL_CAP: usize = 1000;
const FETCH_WORKERS: usize = 4;

#[derive(Debug, Clone)]
struct FetchSpec {
    oid: String,
    node: String,
}

pub async fn run_reconcile_loop(ctx: Arc<NodeContext>) {
    if ctx.config.get().reconcile_freq().is_zero() {
        return;
    }
    loop {
        if let Err(e) = reconcile(&ctx).await {
            tracing::error!("Error in reconciliation loop: {}", e);
        }
        grab_some_data(&ctx).await;
        tokio::time::sleep(ctx.config.get().reconcile_freq()).await;
    }
}

/// Re-record ownership for every blob present on local disk, so metadata
/// lost to crashes or races converges back to what we actually hold.
pub async fn reconcile(ctx: &NodeContext) -> Result<()> {
    let blobs = ctx.store.iter_blobs()?;
    let total = blobs.len();
    for (oid, length) in blobs {
        if let Err(e) =
            record_blob_ownership(ctx.meta.as_ref(), &ctx.node_id, &oid, length).await
        {
            tracing::warn!("Error recording ownership of {}: {}", oid, e);
        }
    }
    tracing::info!("Reconciled {} local blobs", total);
    Ok(())
}

/// Pull under-replicated blobs this node does not hold yet. Every other
/// owner of each such blob is enqueued as a fetch source; the first source
/// that delivers wins, the rest become cheap no-op duplicates.
pub async fn grab_some_data(ctx: &Arc<NodeContext>) {
    let params = ViewParams::default()
        .no_reduce()
        .include_docs()
        .limit(ctx.max_startup_objects)
        .range(json!(1), json!(ctx.max_startup_repls.saturating_sub(1)))
        .fresh();
    let res = match ctx.meta.view(DESIGN, "repcounts", &params).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!("Error finding under-replicated blobs: {}", e);
            return;
        }
    };

    let nodes = match find_remote_nodes(ctx.meta.as_ref(), &ctx.node_id).await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!("Error finding nodes: {}", e);
            return;
        }
    };
    let nm: Arc<HashMap<String, NodeRecord>> = Arc::new(
        nodes
            .0
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect(),
    );

    let (tx, rx) = mpsc::channel::<FetchSpec>(FETCH_CHANNEL_CAP);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(FETCH_WORKERS);
    for _ in 0..FETCH_WORKERS {
        workers.push(tokio::spawn(fetch_worker(ctx.clone(), nm.clone(), rx.clone())));
    }

    for row in &res.rows {
        let Some(record) = row.doc.clone().and_then(|d| BlobOwnership::from_doc(d).ok())
        else {
            continue;
        };
        if record.nodes.contains_key(&ctx.node_id) {
            continue;
        }
        let oid = &row.id[1..];
        for owner in record.owner_names() {
            if owner == ctx.node_id {
                continue;
            }
            let spec = FetchSpec {
                oid: oid.to_string(),
                node: owner,
            };
            if tx.send(spec).await.is_err() {
                break;
            }
        }
    }
    drop(tx);

    for worker in workers {
        let _ = worker.await;
    }
}

async fn fetch_worker(
    ctx: Arc<NodeContext>,
    nm: Arc<HashMap<String, NodeRecord>>,
    rx: Arc<Mutex<mpsc::Receiver<FetchSpec>>>,
) {
    loop {
        let spec = { rx.lock().await.recv().await };
        let Some(spec) = spec else { return };

        let Some(node) = nm.get(&spec.node) else {
            tracing::info!("couldn't find {}", spec.node);
            continue;
        };
        if ctx.store.contains(&spec.oid) {
            continue;
        }

        let url = node.blob_url(&spec.oid);
        tracing::info!("Fetching {} from {}", spec.oid, url);
        match fetch_blob(&ctx, &spec.oid, &url).await {
            Ok(()) => incr(&METRICS.fetches_ok),
            Err(e) => {
                incr(&METRICS.fetch_errors);
                tracing::warn!("Error fetching {}: {}", spec.oid, e);
            }
        }
    }
}

/// Stream one blob from a peer into the local store and record ownership.
///
/// The writer computes the content hash as bytes arrive and commits under
/// whatever it computed; ownership follows that hash, not the requested
/// one, so a corrupt peer cannot poison the key we asked for.
pub async fn fetch_blob(ctx: &NodeContext, oid: &str, url: &str) -> Result<()> {
    let mut writer = ctx.store.writer().await?;

    let mut resp = ctx.http.get(url).send().await?;
    if resp.status().as_u16() != 200 {
        return Err(Error::RemoteStatus {
            status: resp.status().as_u16(),
            url: url.to_string(),
        });
    }

    while let Some(chunk) = resp.chunk().await? {
        writer.write_chunk(&chunk).await?;
    }
    let (actual, length) = writer.commit().await?;

    if actual != oid {
        incr(&METRICS.hash_mismatch);
        tracing::warn!("Requested {} but stored {} ({} bytes)", oid, actual, length);
    }
    record_blob_ownership(ctx.meta.as_ref(), &ctx.node_id, &actual, length).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ownership::get_blob_ownership;
    use crate::cluster::NodeInit;
    use crate::meta::MemMetaStore;
    use crate::store::BlobStore;

    #[tokio::test]
    async fn test_reconcile_records_local_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path()).unwrap());
        let meta = Arc::new(MemMetaStore::new());
        let (ctx, _receivers) = NodeContext::new(
            NodeInit {
                node_id: "n1".to_string(),
                ..NodeInit::default()
            },
            meta,
            store,
            Default::default(),
        )
        .unwrap();

        let (oid, len) = ctx.store.store_bytes(b"some local blob").await.unwrap();
        reconcile(&ctx).await.unwrap();

        let record = get_blob_ownership(ctx.meta.as_ref(), &oid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_names(), vec!["n1"]);
        assert_eq!(record.length, len);
    }
}
