use std::sync::Arc;
use std::time::Duration;

use crate::store::{CoordinationStore, StoreError};

pub const INDEX_LEASE_KEY: &str = "ongoing_indexing";
pub const INDEX_LEASE_TTL: Duration = Duration::from_secs(300);

/// Cluster-wide mutual exclusion for the indexing phase.
///
/// The lease carries no owner token: `release` deletes the key whoever
/// holds it. If a holder dies, the TTL frees the lease.
#[derive(Clone)]
pub struct IndexLease {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
}

impl IndexLease {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            key: INDEX_LEASE_KEY.to_string(),
            ttl: INDEX_LEASE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns whether the caller now holds the lease.
    pub async fn acquire(&self) -> Result<bool, StoreError> {
        self.store.set_nx_ex(&self.key, "1", self.ttl).await
    }

    pub async fn release(&self) -> Result<(), StoreError> {
        self.store.del(&self.key).await?;
        Ok(())
    }
}
