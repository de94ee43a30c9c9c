//! HTTP-backed metadata store
//!
//! Speaks a plain document-store contract:
//!
//! - `POST /kv/{key}?ttl={secs}` - create-only write with expiry, `409` when
//!   the key is held (the lease primitive)
//! - `PUT /kv/{key}` - unconditional write; with `If-Match: <etag>` a
//!   compare-and-swap that fails `412` on a lost race
//! - `GET /kv/{key}` - document plus its `ETag` revision
//! - `DELETE /kv/{key}`
//! - `GET /view/{design}/{name}?...` - view query, JSON-encoded key params
//!
//! Every request carries a deadline so a hung metadata instance cannot stall
//! a control loop.

use crate::common::{Error, Result};
use crate::meta::view::{ViewParams, ViewResult};
use crate::meta::{MetaStore, Mutation, UpdateFn};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CAS_RETRIES: usize = 16;

pub struct HttpMetaStore {
    client: Client,
    base_url: String,
}

impl HttpMetaStore {
    /// `base_url` like `http://meta.example:8091`, no trailing slash.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Host portion of the service URL, for outbound-IP detection.
    pub fn host(&self) -> Option<String> {
        let rest = self.base_url.split("://").nth(1)?;
        let host = rest.split('/').next()?;
        if host.contains(':') {
            Some(host.to_string())
        } else {
            Some(format!("{}:80", host))
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn get_with_rev(&self, key: &str) -> Result<Option<(Value, String)>> {
        let resp = self.client.get(self.kv_url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let etag = resp
                    .headers()
                    .get("etag")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Ok(Some((resp.json().await?, etag)))
            }
            s => Err(Error::RemoteStatus {
                status: s.as_u16(),
                url: self.kv_url(key),
            }),
        }
    }
}

/// Flatten view params into the service's query string. Keys are JSON-encoded
/// so string keys arrive quoted and array keys arrive as arrays.
fn query_pairs(params: &ViewParams) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(key) = &params.key {
        pairs.push(("key".into(), key.to_string()));
    }
    if let Some(startkey) = &params.startkey {
        pairs.push(("startkey".into(), startkey.to_string()));
    }
    if let Some(endkey) = &params.endkey {
        pairs.push(("endkey".into(), endkey.to_string()));
    }
    if let Some(limit) = params.limit {
        pairs.push(("limit".into(), limit.to_string()));
    }
    if params.descending {
        pairs.push(("descending".into(), "true".into()));
    }
    if let Some(reduce) = params.reduce {
        pairs.push(("reduce".into(), reduce.to_string()));
    }
    if params.include_docs {
        pairs.push(("include_docs".into(), "true".into()));
    }
    if let Some(stale) = params.stale {
        pairs.push(("stale".into(), stale.to_string()));
    }
    pairs
}

#[async_trait]
impl MetaStore for HttpMetaStore {
    async fn add(&self, key: &str, doc: Value, ttl: Duration) -> Result<()> {
        let resp = self
            .client
            .post(self.kv_url(key))
            .query(&[("ttl", ttl.as_secs())])
            .json(&doc)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(Error::KeyExists(key.to_string())),
            s if s.is_success() => Ok(()),
            s => Err(Error::RemoteStatus {
                status: s.as_u16(),
                url: self.kv_url(key),
            }),
        }
    }

    async fn set(&self, key: &str, doc: Value) -> Result<()> {
        let resp = self.client.put(self.kv_url(key)).json(&doc).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::RemoteStatus {
                status: resp.status().as_u16(),
                url: self.kv_url(key),
            })
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_with_rev(key).await?.map(|(doc, _)| doc))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.client.delete(self.kv_url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(Error::RemoteStatus {
                status: s.as_u16(),
                url: self.kv_url(key),
            }),
        }
    }

    async fn update(&self, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>> {
        for _ in 0..CAS_RETRIES {
            let current = self.get_with_rev(key).await?;
            let (doc, rev) = match &current {
                Some((doc, rev)) => (Some(doc.clone()), Some(rev.clone())),
                None => (None, None),
            };

            match f(doc.clone()) {
                Mutation::Cancel => return Ok(doc),
                Mutation::Set(new_doc) => {
                    let mut req = self.client.put(self.kv_url(key)).json(&new_doc);
                    req = match &rev {
                        Some(rev) => req.header("If-Match", rev),
                        None => req.header("If-None-Match", "*"),
                    };
                    let resp = req.send().await?;
                    match resp.status() {
                        StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => continue,
                        s if s.is_success() => return Ok(Some(new_doc)),
                        s => {
                            return Err(Error::RemoteStatus {
                                status: s.as_u16(),
                                url: self.kv_url(key),
                            })
                        }
                    }
                }
                Mutation::Delete => {
                    let mut req = self.client.delete(self.kv_url(key));
                    if let Some(rev) = &rev {
                        req = req.header("If-Match", rev);
                    }
                    let resp = req.send().await?;
                    match resp.status() {
                        StatusCode::PRECONDITION_FAILED => continue,
                        StatusCode::NOT_FOUND => return Ok(None),
                        s if s.is_success() => return Ok(None),
                        s => {
                            return Err(Error::RemoteStatus {
                                status: s.as_u16(),
                                url: self.kv_url(key),
                            })
                        }
                    }
                }
            }
        }
        Err(Error::Internal(format!(
            "update of {} lost {} CAS races",
            key, CAS_RETRIES
        )))
    }

    async fn view(&self, design: &str, name: &str, params: &ViewParams) -> Result<ViewResult> {
        let url = format!("{}/view/{}/{}", self.base_url, design, name);
        let resp = self
            .client
            .get(&url)
            .query(&query_pairs(params))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::RemoteStatus {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(resp.json().await?)
    }
}
