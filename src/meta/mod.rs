//! Metadata service client
//!
//! The cluster's shared metadata lives in a document store with
//! secondary-index views. [`MetaStore`] is the surface this node consumes:
//! plain document writes, an atomic set-if-absent with TTL (the distributed
//! lease primitive), an atomic read-modify-write (ownership records are
//! mutated concurrently by several nodes), and view queries.

pub mod http;
pub mod memory;
pub mod view;

pub use http::HttpMetaStore;
pub use memory::MemMetaStore;
pub use view::{cmp_keys, ViewError, ViewParams, ViewResult, ViewRow};

use crate::common::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Design document the node's views live under.
pub const DESIGN: &str = "blobnode";

/// Outcome of one read-modify-write step.
pub enum Mutation {
    /// Store this document
    Set(Value),
    /// Remove the document
    Delete,
    /// Leave the document as it is
    Cancel,
}

/// One read-modify-write closure: gets the current document (if any),
/// decides what to do with it.
pub type UpdateFn<'a> = &'a mut (dyn FnMut(Option<Value>) -> Mutation + Send);

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Set-if-absent with expiry. `Error::KeyExists` when the key is held.
    async fn add(&self, key: &str, doc: Value, ttl: Duration) -> Result<()>;

    /// Unconditional write, no TTL.
    async fn set(&self, key: &str, doc: Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Unconditional delete. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic read-modify-write. Returns the document as stored afterwards
    /// (`None` after a delete, the unchanged document after a cancel).
    async fn update(&self, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>>;

    async fn view(&self, design: &str, name: &str, params: &ViewParams) -> Result<ViewResult>;
}
