//! Leader-election-free periodic task runner
//!
//! Each named maintenance task is guarded by a lease document at
//! `/@<name>`, created with atomic set-if-absent and a TTL equal to the
//! task's period. Whichever node wins the add runs the task; everyone else
//! skips the round. The lease is never released - it simply expires when
//! the next window opens - so a long-running task just pushes the next
//! window out, never runs twice.

use crate::cluster::NodeContext;
use crate::common::metrics::{incr, METRICS};
use crate::common::{now_utc, ClusterConfig, Result};
use crate::meta::MetaStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lease document. Expires on its own; never explicitly deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMarker {
    pub node: String,
    pub started: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A maintenance task body. The one polymorphic boundary in the crate.
#[async_trait]
pub trait JobAction: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// A named task plus the config field that paces it.
pub struct PeriodicJob {
    pub name: &'static str,
    pub period: fn(&ClusterConfig) -> Duration,
    pub action: Arc<dyn JobAction>,
}

/// Run `action` if nobody in the cluster has within the last `period`.
/// Returns whether this node won the round and attempted the task.
pub async fn run_named_global_task(
    meta: &dyn MetaStore,
    node_id: &str,
    name: &str,
    period: Duration,
    action: &dyn JobAction,
) -> bool {
    let key = format!("/@{}", name);

    // a sub-second period would mint a lease that expires instantly (or a
    // zero TTL that never does, depending on the backend) - refuse it
    if period < Duration::from_secs(1) {
        tracing::warn!("would've run with a {:?} ttl, skipping {}", period, name);
        tokio::time::sleep(Duration::from_secs(1)).await;
        return false;
    }

    let marker = JobMarker {
        node: node_id.to_string(),
        started: now_utc(),
        kind: "job".to_string(),
    };
    let doc = serde_json::to_value(&marker).expect("marker serializes");

    match meta.add(&key, doc, period).await {
        Ok(()) => {
            incr(&METRICS.jobs_run);
            if let Err(e) = action.run().await {
                tracing::error!("Error running periodic task {:?}: {}", name, e);
            }
            true
        }
        Err(e) => {
            if !e.is_contention() {
                tracing::debug!("lease claim for {} failed: {}", name, e);
            }
            incr(&METRICS.jobs_skipped);
            false
        }
    }
}

/// Drive one named task forever: claim, run, sleep a period plus a second
/// of slack so the winner's lease has expired before anyone retries.
pub async fn run_periodic_job(ctx: Arc<NodeContext>, job: PeriodicJob) {
    // desynchronize the fleet so one node doesn't win every round
    let jitter = rand::thread_rng().gen_range(5..65);
    tokio::time::sleep(Duration::from_secs(jitter)).await;

    loop {
        let period = (job.period)(&ctx.config.get());
        if run_named_global_task(
            ctx.meta.as_ref(),
            &ctx.node_id,
            job.name,
            period,
            job.action.as_ref(),
        )
        .await
        {
            tracing::info!("Attempted job {}", job.name);
        } else {
            tracing::info!("Didn't run job {}", job.name);
        }
        tokio::time::sleep((job.period)(&ctx.config.get()) + Duration::from_secs(1)).await;
    }
}
