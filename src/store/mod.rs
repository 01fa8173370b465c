//! Durable state store: the key-value checkpoint behind the in-memory registry.
//!
//! The registry stays authoritative while the process runs. The store only
//! lets a restarted process resume sequence history, so every failure here is
//! survivable.

pub mod fs;
pub mod memory;
pub mod persistence;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;
pub use persistence::{
    PersistedDevice, PersistedNode, PersistedSession, RestoreReport, StatePersistence,
};

const NODE_PREFIX: &str = "state:nodes:";
const DEVICE_PREFIX: &str = "state:devices:";
const SESSION_PREFIX: &str = "state:sessions:";
const BIRTH_PREFIX: &str = "state:births:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("state serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Key-value persistence collaborator.
pub trait StateStore: Send + Sync {
    /// Write `value` under `key`; `ttl` of `None` never expires.
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Option<Duration>) -> StoreFuture<'a, ()>;
    /// Expired keys read as absent.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
    /// Live keys starting with `prefix`, sorted.
    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;
}

pub fn node_key(group_id: &str, edge_node_id: &str) -> String {
    format!("{NODE_PREFIX}{group_id}:{edge_node_id}")
}

pub fn device_key(group_id: &str, edge_node_id: &str, device_id: &str) -> String {
    format!("{DEVICE_PREFIX}{group_id}:{edge_node_id}:{device_id}")
}

pub fn session_key(client_id: &str) -> String {
    format!("{SESSION_PREFIX}{client_id}")
}

/// `kind` is `NBIRTH` or `DBIRTH`.
pub fn birth_key(kind: &str, group_id: &str, edge_node_id: &str, device_id: Option<&str>) -> String {
    match device_id {
        Some(device_id) => format!("{BIRTH_PREFIX}{kind}:{group_id}:{edge_node_id}:{device_id}"),
        None => format!("{BIRTH_PREFIX}{kind}:{group_id}:{edge_node_id}"),
    }
}

pub(crate) fn node_prefix() -> &'static str {
    NODE_PREFIX
}

pub(crate) fn device_prefix() -> &'static str {
    DEVICE_PREFIX
}

pub(crate) fn session_prefix() -> &'static str {
    SESSION_PREFIX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(node_key("G1", "N1"), "state:nodes:G1:N1");
        assert_eq!(device_key("G1", "N1", "D1"), "state:devices:G1:N1:D1");
        assert_eq!(session_key("C1"), "state:sessions:C1");
        assert_eq!(birth_key("NBIRTH", "G1", "N1", None), "state:births:NBIRTH:G1:N1");
        assert_eq!(
            birth_key("DBIRTH", "G1", "N1", Some("D1")),
            "state:births:DBIRTH:G1:N1:D1"
        );
    }
}
