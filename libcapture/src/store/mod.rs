use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod xline;

pub use memory::MemoryStore;
pub use xline::{XlineConfig, XlineStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unexpected response from coordination store: {0}")]
    Protocol(String),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

/// The shared key-value store every daemon instance coordinates through.
///
/// Hashes hold the location registry and the heartbeat, sets hold index
/// flags and index contents, plain keys hold leases. Each method is a single
/// atomic operation on the backing store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn hexists(&self, hash: &str, field: &str) -> Result<bool, StoreError>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether the field existed.
    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, StoreError>;

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Set `key` only if it is absent, expiring it after `ttl`.
    /// Returns whether this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns whether the member was newly added.
    async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Membership of each `(set, member)` pair, read in one round trip.
    async fn sismember_many(&self, probes: &[(&str, &str)]) -> Result<Vec<bool>, StoreError>;
}
