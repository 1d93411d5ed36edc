use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CoordinationStore, StoreError};

/// In-process coordination store.
///
/// Every clone shares the same state, so several components (or several
/// simulated daemon instances in tests) can contend on it. Expiry is driven
/// by the tokio clock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    keys: HashMap<String, (String, Option<Instant>)>,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.keys
            .retain(|_, (_, deadline)| deadline.is_none_or(|d| d > now));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn hexists(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(hash)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get_mut(hash)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(hash)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        inner.keys.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner.keys.remove(key).is_some())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember_many(&self, probes: &[(&str, &str)]) -> Result<Vec<bool>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(probes
            .iter()
            .map(|(set, member)| inner.sets.get(*set).is_some_and(|s| s.contains(*member)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_round_trip() {
        let store = MemoryStore::new();
        assert!(!store.hexists("lookup_dirs", "u1").await.unwrap());
        store.hset("lookup_dirs", "u1", "/a").await.unwrap();
        assert!(store.hexists("lookup_dirs", "u1").await.unwrap());
        assert_eq!(
            store.hget("lookup_dirs", "u1").await.unwrap().as_deref(),
            Some("/a")
        );
        assert!(store.hdel("lookup_dirs", "u1").await.unwrap());
        assert!(!store.hdel("lookup_dirs", "u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_ex_expires() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx_ex("k", "1", ttl).await.unwrap());
        assert!(!store.set_nx_ex("k", "1", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_nx_ex("k", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_batched_membership() {
        let store = MemoryStore::new();
        store.sadd("indexed_urls", "u1").await.unwrap();
        let flags = store
            .sismember_many(&[("indexed_urls", "u1"), ("indexed_cookies", "u1")])
            .await
            .unwrap();
        assert_eq!(flags, vec![true, false]);
    }
}
