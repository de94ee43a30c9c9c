//! Stale-node detection and cleanup
//!
//! A node that stops heartbeating past `StaleNodeLimit` is dead to the
//! cluster. The sweep rehomes its blobs a bounded batch at a time and only
//! deletes the node record once a pass observes no remaining blobs - that
//! makes cleanup idempotent and resumable, and a large departed node is
//! drained over several sweeps instead of one burst.

use crate::cluster::jobs::JobAction;
use crate::cluster::node::{find_all_nodes, NodeList};
use crate::cluster::ownership::remove_blob_ownership;
use crate::cluster::workers::queue_blob_acquire;
use crate::cluster::NodeContext;
use crate::common::metrics::{incr, METRICS};
use crate::common::{now_utc, Result};
use crate::meta::{MetaStore, ViewParams, DESIGN};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct StaleNodeSweep {
    pub ctx: Arc<NodeContext>,
}

#[async_trait]
impl JobAction for StaleNodeSweep {
    async fn run(&self) -> Result<()> {
        check_stale_nodes(self.ctx.clone()).await
    }
}

pub async fn check_stale_nodes(ctx: Arc<NodeContext>) -> Result<()> {
    tracing::info!("Checking stale nodes");
    let nodes = find_all_nodes(ctx.meta.as_ref()).await?;
    let limit = ctx.config.get().stale_node_limit();
    let now = now_utc();

    for node in nodes.iter() {
        let age = node.age(now);
        if age > limit {
            if node.name == ctx.node_id {
                // local clock skew should never make us sweep ourselves
                tracing::info!("Would've cleaned up myself after {:?}", age);
                continue;
            }
            tracing::info!("  Node {} missed heartbeat schedule: {:?}", node.name, age);
            tokio::spawn(cleanup_node(ctx.clone(), node.name.clone()));
        } else {
            tracing::debug!("{} is ok at {:?}", node.name, age);
        }
    }
    Ok(())
}

/// Drain up to `node_clean_count` blobs off a dead node, salvaging any that
/// fell under the replication floor, then delete its records once empty.
pub async fn cleanup_node(ctx: Arc<NodeContext>, node: String) {
    let nodes = match find_all_nodes(ctx.meta.as_ref()).await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!("Error finding node list, aborting clean: {}", e);
            return;
        }
    };

    tracing::info!("Cleaning up node {}", node);
    let config = ctx.config.get();
    let params = ViewParams::default()
        .key(json!(node))
        .limit(config.node_clean_count)
        .no_reduce()
        .fresh();
    let res = match ctx.meta.view(DESIGN, "node_blobs", &params).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!("Error executing node_blobs view: {}", e);
            return;
        }
    };

    let mut found_rows = 0;
    for row in &res.rows {
        let oid = &row.id[1..];
        found_rows += 1;

        match remove_blob_ownership(ctx.meta.as_ref(), oid, &node).await {
            Ok(owners) => {
                if owners.len() < config.min_replicas {
                    salvage_blob(&ctx, oid, &node, &owners, &nodes).await;
                }
            }
            Err(e) => tracing::error!("Error removing ownership of {}: {}", oid, e),
        }
    }

    if found_rows == 0 && res.errors.is_empty() {
        tracing::info!("Removing node record: {}", node);
        if let Err(e) = ctx.meta.delete(&format!("/{}", node)).await {
            tracing::error!("Error deleting {} node record: {}", node, e);
        }
        if let Err(e) = ctx.meta.delete(&format!("/{}/r", node)).await {
            tracing::error!("Error deleting {} node counter: {}", node, e);
        }
        incr(&METRICS.nodes_cleaned);
    } else {
        incr(&METRICS.cleanup_blocked);
    }
}

/// Direct some surviving peer to pick up a replica that just fell below the
/// floor. No candidate means the invariant stays violated until a later
/// repair pass finds one.
pub async fn salvage_blob(
    ctx: &NodeContext,
    oid: &str,
    dead_node: &str,
    owners: &[String],
    nodes: &NodeList,
) {
    let candidates = nodes.candidates_for(owners, &[dead_node]);
    match candidates.first() {
        Some(candidate) => {
            if let Err(e) = queue_blob_acquire(ctx, candidate, oid).await {
                tracing::warn!("Error queueing acquire of {} on {}: {}", oid, candidate.name, e);
            }
        }
        None => {
            tracing::warn!("Couldn't find a candidate for blob {}!", oid);
            incr(&METRICS.salvage_no_candidate);
        }
    }
}
