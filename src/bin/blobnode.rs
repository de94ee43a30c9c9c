use anyhow::Result;
use blobnode::cluster::{bootstrap, heartbeat, spawn_periodic_jobs, workers, NodeContext, NodeInit};
use blobnode::common::ConfigHandle;
use blobnode::meta::HttpMetaStore;
use blobnode::{api, BlobStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "blobnode")]
#[command(about = "Blobnode - distributed content-addressed blob store node")]
struct Args {
    /// Data directory for blob storage
    #[arg(short, long, default_value = "./data")]
    root: PathBuf,

    /// Address to serve blobs on, as peers should dial it
    #[arg(short, long, default_value = "0.0.0.0:8484")]
    bind_addr: String,

    /// Metadata service base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8091")]
    meta_url: String,

    /// Node identity; defaults to the one persisted in the data directory
    #[arg(long)]
    server_id: Option<String>,

    /// Advertised storage ceiling in bytes; 0 means whatever the disk has
    #[arg(long, default_value_t = 0)]
    max_storage: u64,

    /// Number of blob acquire/removal workers
    #[arg(long, default_value_t = 4)]
    verify_workers: usize,

    /// Maximum number of objects to pull on start
    #[arg(long, default_value_t = 1000)]
    max_start_objs: usize,

    /// Blob replication limit for startup objects
    #[arg(long, default_value_t = 3)]
    max_start_repls: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Node identity: the flag wins, else whatever a previous boot persisted,
/// else a fresh id written for next time.
fn resolve_server_id(root: &std::path::Path, flag: Option<String>) -> Result<String> {
    if let Some(id) = flag {
        return Ok(id);
    }
    let id_path = root.join("server-id");
    if let Ok(id) = std::fs::read_to_string(&id_path) {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&id_path, &id)?;
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&args.root)?;
    let node_id = resolve_server_id(&args.root, args.server_id.clone())?;

    tracing::info!("Starting blobnode {}", blobnode::VERSION);
    tracing::info!("Node ID: {}", node_id);
    tracing::info!("Blob endpoint: {}", args.bind_addr);
    tracing::info!("Metadata service: {}", args.meta_url);
    tracing::info!("Data directory: {}", args.root.display());

    let store = Arc::new(BlobStore::open(&args.root)?);
    let meta = Arc::new(HttpMetaStore::new(&args.meta_url)?);
    let meta_host = meta.host();

    // best-effort initial tunables; the refresher keeps them current
    let config = ConfigHandle::default();
    if let Err(e) = heartbeat::update_config(meta.as_ref(), &config).await {
        tracing::warn!("Starting with default config: {}", e);
    }

    let (ctx, receivers) = NodeContext::new(
        NodeInit {
            node_id,
            bind_addr: args.bind_addr.clone(),
            meta_host,
            max_storage: args.max_storage,
            max_startup_objects: args.max_start_objs,
            max_startup_repls: args.max_start_repls,
        },
        meta,
        store,
        config,
    )?;

    workers::spawn_workers(ctx.clone(), receivers, args.verify_workers);
    tokio::spawn(heartbeat::run_heartbeat(ctx.clone()));
    tokio::spawn(heartbeat::run_config_refresher(ctx.clone()));
    tokio::spawn(bootstrap::run_reconcile_loop(ctx.clone()));
    spawn_periodic_jobs(&ctx);

    let listener = tokio::net::TcpListener::bind(&args.bind_addr).await?;
    tracing::info!("✓ blobnode ready");
    axum::serve(listener, api::create_router(ctx)).await?;

    Ok(())
}
