//! Replica-count repair and pruning
//!
//! Both tasks walk the `repcounts` view, which keys every ownership record
//! by its current owner count, and push work onto the blob queues. Neither
//! holds any state between rounds: a pass interrupted half-way leaves
//! nothing to undo, and the next pass re-derives whatever is still wrong.

use crate::cluster::jobs::JobAction;
use crate::cluster::node::find_all_nodes;
use crate::cluster::ownership::BlobOwnership;
use crate::cluster::workers::queue_blob_acquire;
use crate::cluster::NodeContext;
use crate::common::metrics::{incr, METRICS};
use crate::common::Result;
use crate::meta::{MetaStore, ViewParams, DESIGN};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct ReplicaRepair {
    pub ctx: Arc<NodeContext>,
}

#[async_trait]
impl JobAction for ReplicaRepair {
    async fn run(&self) -> Result<()> {
        ensure_minimum_replica_count(&self.ctx).await
    }
}

pub struct ReplicaPrune {
    pub ctx: Arc<NodeContext>,
}

#[async_trait]
impl JobAction for ReplicaPrune {
    async fn run(&self) -> Result<()> {
        prune_excessive_replicas(&self.ctx).await
    }
}

/// Find blobs below the replication floor and direct a candidate peer at
/// each. One new replica per blob per pass; repeated passes converge.
pub async fn ensure_minimum_replica_count(ctx: &NodeContext) -> Result<()> {
    let config = ctx.config.get();
    if config.min_replicas < 2 {
        return Ok(());
    }

    let params = ViewParams::default()
        .no_reduce()
        .include_docs()
        .range(json!(1), json!(config.min_replicas - 1))
        .limit(config.repair_batch)
        .fresh();
    let res = ctx.meta.view(DESIGN, "repcounts", &params).await?;
    res.check_errors()?;

    let nodes = find_all_nodes(ctx.meta.as_ref()).await?;

    let mut scheduled = 0;
    for row in &res.rows {
        let oid = &row.id[1..];
        let Some(record) = row.doc.clone().and_then(|d| BlobOwnership::from_doc(d).ok())
        else {
            tracing::warn!("repcounts row for {} carried no ownership record", oid);
            continue;
        };

        let owners = record.owner_names();
        let candidates = nodes.candidates_for(&owners, &[]);
        match candidates.first() {
            Some(candidate) => {
                if let Err(e) = queue_blob_acquire(ctx, candidate, oid).await {
                    tracing::warn!(
                        "Error queueing acquire of {} on {}: {}",
                        oid,
                        candidate.name,
                        e
                    );
                } else {
                    scheduled += 1;
                }
            }
            None => {
                tracing::warn!("No candidate to repair {}", oid);
                incr(&METRICS.salvage_no_candidate);
            }
        }
    }

    tracing::info!("Scheduled {} under-replicated blobs for acquisition", scheduled);
    Ok(())
}

/// Find blobs above the replication ceiling and shed the excess replicas,
/// remote owners first so a node keeps the copies it already paid for.
pub async fn prune_excessive_replicas(ctx: &NodeContext) -> Result<()> {
    let config = ctx.config.get();

    let params = ViewParams::default()
        .no_reduce()
        .include_docs()
        .startkey(json!(config.max_replicas + 1))
        .limit(config.repair_batch)
        .fresh();
    let res = ctx.meta.view(DESIGN, "repcounts", &params).await?;
    res.check_errors()?;

    let mut scheduled = 0;
    for row in &res.rows {
        let oid = &row.id[1..];
        let Some(record) = row.doc.clone().and_then(|d| BlobOwnership::from_doc(d).ok())
        else {
            tracing::warn!("repcounts row for {} carried no ownership record", oid);
            continue;
        };

        let mut owners = record.owner_names();
        let excess = owners.len().saturating_sub(config.max_replicas);
        owners.sort_by_key(|name| name == &ctx.node_id);

        for owner in owners.into_iter().take(excess) {
            match ctx.queues.enqueue_removal(oid, &owner) {
                Ok(()) => scheduled += 1,
                Err(e) => tracing::warn!("Dropping removal of {}: {}", oid, e),
            }
        }
    }

    tracing::info!("Scheduled {} excess replicas for removal", scheduled);
    Ok(())
}
