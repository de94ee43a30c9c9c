//! Error types for blobnode

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Metadata Errors ===
    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("View errors: {0}")]
    ViewErrors(String),

    #[error("Malformed record: {0}")]
    BadRecord(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    RemoteStatus { status: u16, url: String },

    // === Store Errors ===
    /// The filesystem does not report free space on this platform. The
    /// heartbeat recognizes this sentinel and stays silent about it.
    #[error("no filesystem free-space support")]
    NoFsFree,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Was this a lost race for a lease rather than a real failure?
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::KeyExists(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
