//! Peer-facing HTTP surface
//!
//! The endpoints other nodes drive:
//! - `GET /.cbfs/blob/{hash}` streams a replica out
//! - `DELETE /.cbfs/blob/{hash}` drops the local replica and this node's
//!   ownership entry (the receiving end of orphan GC and pruning)
//! - `POST /.cbfs/fetch/{hash}` asks this node to go acquire a replica
//!   (the receiving end of salvage and repair)
//! - `GET /.cbfs/stats` exposes the process counters

use crate::cluster::{ownership, NodeContext};
use crate::common::{Error, METRICS};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

pub fn create_router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/.cbfs/blob/:oid", get(get_blob).delete(delete_blob))
        .route("/.cbfs/fetch/:oid", post(fetch_blob))
        .route("/.cbfs/stats", get(stats))
        .with_state(ctx)
}

async fn get_blob(State(ctx): State<Arc<NodeContext>>, Path(oid): Path<String>) -> Response {
    match ctx.store.open_blob(&oid).await {
        Ok(file) => {
            let headers = [(header::CONTENT_TYPE, "application/octet-stream")];
            (headers, Body::from_stream(ReaderStream::new(file))).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_blob(
    State(ctx): State<Arc<NodeContext>>,
    Path(oid): Path<String>,
) -> StatusCode {
    match ctx.store.delete_blob(&oid) {
        Ok(_) => {}
        Err(Error::NotFound(_)) | Err(Error::BadRecord(_)) => return StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Error deleting blob {}: {}", oid, e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    if let Err(e) =
        ownership::remove_blob_ownership(ctx.meta.as_ref(), &oid, &ctx.node_id).await
    {
        tracing::error!("Error disowning blob {}: {}", oid, e);
    }
    StatusCode::NO_CONTENT
}

async fn fetch_blob(State(ctx): State<Arc<NodeContext>>, Path(oid): Path<String>) -> StatusCode {
    match ctx.queues.enqueue_acquire(&oid) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::warn!("Rejecting fetch request for {}: {}", oid, e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn stats() -> impl IntoResponse {
    Json(METRICS.snapshot())
}
