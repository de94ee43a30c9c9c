//! Common utilities and types shared across blobnode

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{ClusterConfig, ConfigHandle, CONFIG_KEY};
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use utils::{format_bytes, now_utc};
