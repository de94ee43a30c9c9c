//! Cluster coordination
//!
//! Everything that keeps one node a good citizen of the cluster: the
//! heartbeat, the lease-guarded periodic maintenance tasks, the blob work
//! queues, and the startup pull. All of it hangs off a shared
//! [`NodeContext`].

pub mod bootstrap;
pub mod gc;
pub mod heartbeat;
pub mod jobs;
pub mod node;
pub mod ownership;
pub mod repair;
pub mod sweep;
pub mod workers;

pub use jobs::{JobAction, JobMarker, PeriodicJob};
pub use node::{find_all_nodes, find_node_map, find_remote_nodes, NodeList, NodeRecord};
pub use ownership::BlobOwnership;
pub use workers::{WorkQueues, WorkReceivers};

use crate::common::{ConfigHandle, Result};
use crate::meta::MetaStore;
use crate::store::BlobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-level inputs fixed at launch.
#[derive(Debug, Clone)]
pub struct NodeInit {
    /// Stable node identity
    pub node_id: String,
    /// host:port of the local blob endpoint, as peers should dial it
    pub bind_addr: String,
    /// Metadata-service host:port, used for outbound-IP detection
    pub meta_host: Option<String>,
    /// Advertised storage ceiling in bytes; zero means unbounded
    pub max_storage: u64,
    /// Startup-pull row limit
    pub max_startup_objects: usize,
    /// Startup-pull replica-count upper bound (exclusive)
    pub max_startup_repls: usize,
}

impl Default for NodeInit {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bind_addr: String::new(),
            meta_host: None,
            max_storage: 0,
            max_startup_objects: 1000,
            max_startup_repls: 3,
        }
    }
}

/// Shared state of one running node.
pub struct NodeContext {
    pub node_id: String,
    pub bind_addr: String,
    pub meta_host: Option<String>,
    pub max_storage: u64,
    pub max_startup_objects: usize,
    pub max_startup_repls: usize,

    pub meta: Arc<dyn MetaStore>,
    pub store: Arc<BlobStore>,
    pub config: ConfigHandle,
    pub http: reqwest::Client,
    pub queues: WorkQueues,
}

impl NodeContext {
    /// Assemble the context. The returned receivers belong to
    /// [`workers::spawn_workers`] (or to a test that wants to observe the
    /// queues instead of draining them).
    pub fn new(
        init: NodeInit,
        meta: Arc<dyn MetaStore>,
        store: Arc<BlobStore>,
        config: ConfigHandle,
    ) -> Result<(Arc<Self>, WorkReceivers)> {
        let http = reqwest::Client::builder()
            .connect_timeout(PEER_CONNECT_TIMEOUT)
            .timeout(PEER_REQUEST_TIMEOUT)
            .build()?;
        let (queues, receivers) = WorkQueues::new();

        let ctx = Arc::new(Self {
            node_id: init.node_id,
            bind_addr: init.bind_addr,
            meta_host: init.meta_host,
            max_storage: init.max_storage,
            max_startup_objects: init.max_startup_objects,
            max_startup_repls: init.max_startup_repls,
            meta,
            store,
            config,
            http,
            queues,
        });
        Ok((ctx, receivers))
    }
}

/// The four cluster maintenance tasks, each paced by its own tunable.
pub fn periodic_jobs(ctx: &Arc<NodeContext>) -> Vec<PeriodicJob> {
    vec![
        PeriodicJob {
            name: "checkStaleNodes",
            period: |c| c.stale_node_check_freq(),
            action: Arc::new(sweep::StaleNodeSweep { ctx: ctx.clone() }),
        },
        PeriodicJob {
            name: "garbageCollectBlobs",
            period: |c| c.gc_freq(),
            action: Arc::new(gc::OrphanGc { ctx: ctx.clone() }),
        },
        PeriodicJob {
            name: "ensureMinReplCount",
            period: |c| c.under_replica_check_freq(),
            action: Arc::new(repair::ReplicaRepair { ctx: ctx.clone() }),
        },
        PeriodicJob {
            name: "pruneExcessiveReplicas",
            period: |c| c.over_replica_check_freq(),
            action: Arc::new(repair::ReplicaPrune { ctx: ctx.clone() }),
        },
    ]
}

/// One runner task per periodic job.
pub fn spawn_periodic_jobs(ctx: &Arc<NodeContext>) -> Vec<JoinHandle<()>> {
    periodic_jobs(ctx)
        .into_iter()
        .map(|job| tokio::spawn(jobs::run_periodic_job(ctx.clone(), job)))
        .collect()
}
