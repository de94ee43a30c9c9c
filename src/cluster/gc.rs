//! Orphan-blob garbage collection
//!
//! A blob nobody's file references anymore is dead weight on every node
//! holding it. The `file_blobs` view interleaves, per blob hash, a row for
//! each referencing file and a row for each owning node; scanned descending,
//! the file rows of a hash arrive before its blob rows ("blob" sorts before
//! "file" ascending). One watermark of the most recent file-tagged hash is
//! therefore enough to decide, at every blob-tagged row, whether any
//! reference exists.

use crate::cluster::jobs::JobAction;
use crate::cluster::node::find_node_map;
use crate::cluster::NodeContext;
use crate::common::metrics::{incr, METRICS};
use crate::common::Result;
use crate::meta::{MetaStore, ViewParams, DESIGN};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct OrphanGc {
    pub ctx: Arc<NodeContext>,
}

#[async_trait]
impl JobAction for OrphanGc {
    async fn run(&self) -> Result<()> {
        garbage_collect_blobs(&self.ctx).await
    }
}

pub async fn garbage_collect_blobs(ctx: &NodeContext) -> Result<()> {
    tracing::info!("Garbage collecting blobs without any file references");

    let config = ctx.config.get();
    // descending because we want file sorted before blob within each hash
    let params = ViewParams::default()
        .descending()
        .limit(config.gc_limit)
        .fresh();
    let res = ctx.meta.view(DESIGN, "file_blobs", &params).await?;
    res.check_errors()?;

    let nm = find_node_map(ctx.meta.as_ref()).await?;

    let mut last_blob = String::new();
    let mut count = 0;
    for row in &res.rows {
        let (Some(blob), Some(tag)) = (
            row.key.get(0).and_then(Value::as_str),
            row.key.get(1).and_then(Value::as_str),
        ) else {
            tracing::warn!("Malformed file_blobs key: {}", row.key);
            continue;
        };

        match tag {
            "file" => last_blob = blob.to_string(),
            "blob" => {
                if blob != last_blob {
                    let node = row.key.get(2).and_then(Value::as_str).unwrap_or("");
                    if nm.contains_key(node) {
                        match ctx.queues.enqueue_removal(blob, node) {
                            Ok(()) => {
                                incr(&METRICS.gc_scheduled);
                                count += 1;
                            }
                            Err(e) => {
                                tracing::warn!("Dropping removal of {}: {}", blob, e)
                            }
                        }
                    } else {
                        tracing::info!("No nodemap entry for {}", node);
                    }
                }
            }
            _ => {}
        }
    }

    tracing::info!("Scheduled {} blobs for deletion", count);
    Ok(())
}
