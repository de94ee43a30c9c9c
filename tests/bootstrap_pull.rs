//! Startup replication pull against real peers on loopback

use blobnode::cluster::bootstrap::{fetch_blob, grab_some_data};
use blobnode::cluster::heartbeat::publish_heartbeat;
use blobnode::cluster::ownership::{get_blob_ownership, record_blob_ownership};
use blobnode::cluster::{NodeContext, NodeInit};
use blobnode::common::ConfigHandle;
use blobnode::meta::{MemMetaStore, MetaStore};
use blobnode::{api, BlobStore};
use std::sync::Arc;
use tempfile::TempDir;

struct TestNode {
    ctx: Arc<NodeContext>,
    _dir: TempDir,
}

async fn start_peer(name: &str, meta: Arc<MemMetaStore>) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (ctx, _receivers) = NodeContext::new(
        NodeInit {
            node_id: name.to_string(),
            bind_addr: addr,
            ..NodeInit::default()
        },
        meta,
        store,
        ConfigHandle::default(),
    )
    .unwrap();

    let router = api::create_router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    publish_heartbeat(&ctx).await.unwrap();
    TestNode { ctx, _dir: dir }
}

fn fresh_node(name: &str, meta: Arc<MemMetaStore>, max_objs: usize) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());
    let (ctx, _receivers) = NodeContext::new(
        NodeInit {
            node_id: name.to_string(),
            max_startup_objects: max_objs,
            max_startup_repls: 3,
            ..NodeInit::default()
        },
        meta,
        store,
        ConfigHandle::default(),
    )
    .unwrap();
    TestNode { ctx, _dir: dir }
}

/// Seed a blob on a peer and register its ownership.
async fn seed(peer: &TestNode, meta: &dyn MetaStore, data: &[u8]) -> String {
    let (oid, len) = peer.ctx.store.store_bytes(data).await.unwrap();
    record_blob_ownership(meta, &peer.ctx.node_id, &oid, len)
        .await
        .unwrap();
    oid
}

#[tokio::test]
async fn test_fresh_node_pulls_under_replicated_blobs() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 1000);

    let mut oids = Vec::new();
    for i in 0..3u8 {
        oids.push(seed(&a, meta.as_ref(), &[i, i, i]).await);
    }

    // drains its own worker pool before returning
    grab_some_data(&d.ctx).await;

    for oid in &oids {
        assert!(d.ctx.store.contains(oid), "missing {}", oid);
        let record = get_blob_ownership(meta.as_ref(), oid).await.unwrap().unwrap();
        let mut owners = record.owner_names();
        owners.sort();
        assert_eq!(owners, vec!["a", "d"]);
    }
}

#[tokio::test]
async fn test_startup_object_limit_bounds_the_pull() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 3);

    for i in 0..5u8 {
        seed(&a, meta.as_ref(), &[10 + i]).await;
    }

    grab_some_data(&d.ctx).await;

    assert_eq!(d.ctx.store.iter_blobs().unwrap().len(), 3);
}

#[tokio::test]
async fn test_blobs_already_owned_are_skipped() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 1000);

    let oid = seed(&a, meta.as_ref(), b"already mine on paper").await;
    // metadata says d owns it too (count 2, still under the startup bound)
    record_blob_ownership(meta.as_ref(), "d", &oid, 21).await.unwrap();

    grab_some_data(&d.ctx).await;

    // a row whose owner set includes us is not a fetch candidate
    assert!(!d.ctx.store.contains(&oid));
}

#[tokio::test]
async fn test_fully_replicated_blobs_are_out_of_range() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 1000);

    let oid = seed(&a, meta.as_ref(), b"well replicated").await;
    for n in ["b", "c"] {
        record_blob_ownership(meta.as_ref(), n, &oid, 15).await.unwrap();
    }

    grab_some_data(&d.ctx).await;

    // count 3 is outside [1, maxStartRepls-1]
    assert!(!d.ctx.store.contains(&oid));
}

#[tokio::test]
async fn test_fetch_stores_under_the_computed_hash() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 1000);

    let (real_oid, _) = a.ctx.store.store_bytes(b"honest bytes").await.unwrap();
    let url = format!("http://{}/.cbfs/blob/{}", a.ctx.bind_addr, real_oid);

    // ask for a hash the peer's bytes do not match
    let requested = "00".repeat(32);
    fetch_blob(&d.ctx, &requested, &url).await.unwrap();

    // the blob landed under what the writer computed; the requested key
    // was dropped
    assert!(d.ctx.store.contains(&real_oid));
    assert!(!d.ctx.store.contains(&requested));
    let record = get_blob_ownership(meta.as_ref(), &real_oid)
        .await
        .unwrap()
        .unwrap();
    assert!(record.nodes.contains_key("d"));
    assert!(get_blob_ownership(meta.as_ref(), &requested)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pull_from_two_owners_converges_to_one_copy() {
    let meta = Arc::new(MemMetaStore::new());
    let a = start_peer("a", meta.clone()).await;
    let b = start_peer("b", meta.clone()).await;
    let d = fresh_node("d", meta.clone(), 1000);

    let (oid, len) = a.ctx.store.store_bytes(b"two sources").await.unwrap();
    b.ctx.store.store_bytes(b"two sources").await.unwrap();
    record_blob_ownership(meta.as_ref(), "a", &oid, len).await.unwrap();
    record_blob_ownership(meta.as_ref(), "b", &oid, len).await.unwrap();

    grab_some_data(&d.ctx).await;

    // both owners were enqueued as sources; the store converged on one blob
    assert!(d.ctx.store.contains(&oid));
    assert_eq!(d.ctx.store.iter_blobs().unwrap().len(), 1);
    let record = get_blob_ownership(meta.as_ref(), &oid).await.unwrap().unwrap();
    assert!(record.nodes.contains_key("d"));
}
