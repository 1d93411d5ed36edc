use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::store::{CoordinationStore, StoreError};
use crate::tree::CaptureTree;

/// The secondary indexes, in the order a capture is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Urls,
    BodyHashes,
    Cookies,
    HeaderHashes,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Urls,
        IndexKind::BodyHashes,
        IndexKind::Cookies,
        IndexKind::HeaderHashes,
    ];

    /// Set holding the UUIDs already indexed for this kind.
    pub fn flag_set(self) -> &'static str {
        match self {
            IndexKind::Urls => "indexed_urls",
            IndexKind::BodyHashes => "indexed_body_hashes",
            IndexKind::Cookies => "indexed_cookies",
            IndexKind::HeaderHashes => "indexed_hhhashes",
        }
    }

    /// Set of every key known to this index.
    pub fn keys_set(self) -> &'static str {
        match self {
            IndexKind::Urls => "urls",
            IndexKind::BodyHashes => "body_hashes",
            IndexKind::Cookies => "cookies_names",
            IndexKind::HeaderHashes => "hhhashes",
        }
    }

    /// Set of captures containing `key`.
    pub fn captures_set(self, key: &str) -> String {
        format!("{}|{key}|captures", self.keys_set())
    }

    fn keys_of(self, tree: &CaptureTree) -> BTreeSet<&str> {
        let nodes = tree.nodes.iter();
        match self {
            IndexKind::Urls => nodes.map(|n| n.url.as_str()).collect(),
            IndexKind::BodyHashes => nodes.filter_map(|n| n.body_hash.as_deref()).collect(),
            IndexKind::Cookies => nodes
                .flat_map(|n| n.cookies.iter().map(String::as_str))
                .collect(),
            IndexKind::HeaderHashes => nodes.filter_map(|n| n.hhhash.as_deref()).collect(),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexKind::Urls => "urls",
            IndexKind::BodyHashes => "resources",
            IndexKind::Cookies => "cookies",
            IndexKind::HeaderHashes => "HH Hashes",
        };
        f.write_str(name)
    }
}

/// Index flags of one capture, in [`IndexKind::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexFlags([bool; 4]);

impl IndexFlags {
    pub fn is_set(&self, kind: IndexKind) -> bool {
        self.0[kind as usize]
    }

    pub fn all(&self) -> bool {
        self.0.iter().all(|f| *f)
    }

    pub fn missing(&self) -> Vec<IndexKind> {
        IndexKind::ALL
            .into_iter()
            .filter(|k| !self.is_set(*k))
            .collect()
    }
}

/// Reads and writes the secondary indexes in the coordination store.
#[derive(Clone)]
pub struct Indexing {
    store: Arc<dyn CoordinationStore>,
}

impl Indexing {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// All four flags of `uuid` in one round trip.
    pub async fn flags(&self, uuid: &str) -> Result<IndexFlags, StoreError> {
        let probes: Vec<(&str, &str)> = IndexKind::ALL
            .iter()
            .map(|k| (k.flag_set(), uuid))
            .collect();
        let found = self.store.sismember_many(&probes).await?;
        let mut flags = [false; 4];
        for (slot, value) in flags.iter_mut().zip(found) {
            *slot = value;
        }
        Ok(IndexFlags(flags))
    }

    /// Add the capture to one index, then mark it indexed.
    ///
    /// Re-running is harmless: every write is a set insertion.
    pub async fn index(&self, kind: IndexKind, tree: &CaptureTree) -> Result<(), StoreError> {
        for key in kind.keys_of(tree) {
            self.store.sadd(kind.keys_set(), key).await?;
            self.store.sadd(&kind.captures_set(key), &tree.uuid).await?;
        }
        self.store.sadd(kind.flag_set(), &tree.uuid).await?;
        Ok(())
    }

    pub async fn captures_for(&self, kind: IndexKind, key: &str) -> Result<Vec<String>, StoreError> {
        self.store.smembers(&kind.captures_set(key)).await
    }

    pub async fn keys(&self, kind: IndexKind) -> Result<Vec<String>, StoreError> {
        self.store.smembers(kind.keys_set()).await
    }
}
