use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::quarantine::Quarantine;
use crate::store::{CoordinationStore, StoreError};

/// Hash mapping capture UUIDs to their canonical directory.
pub const LOOKUP_DIRS: &str = "lookup_dirs";

/// Result of reconciling an observed capture path with the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No entry existed; the observed path is now canonical.
    Registered,
    /// The entry already pointed at the observed path.
    Unchanged,
    /// The registered path no longer existed and was replaced.
    Corrected { stale: PathBuf },
    /// Another live directory owns the UUID; the observed one was quarantined.
    Duplicate {
        canonical: PathBuf,
        quarantined: Result<PathBuf, String>,
    },
}

impl Resolution {
    /// Whether the candidate may go on to be built.
    pub fn is_canonical(&self) -> bool {
        !matches!(self, Resolution::Duplicate { .. })
    }
}

#[derive(Clone)]
pub struct LocationRegistry {
    store: Arc<dyn CoordinationStore>,
}

impl LocationRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, uuid: &str) -> Result<Option<PathBuf>, StoreError> {
        Ok(self.store.hget(LOOKUP_DIRS, uuid).await?.map(PathBuf::from))
    }

    pub async fn register(&self, uuid: &str, path: &Path) -> Result<(), StoreError> {
        self.store
            .hset(LOOKUP_DIRS, uuid, &path.to_string_lossy())
            .await
    }

    pub async fn remove(&self, uuid: &str) -> Result<bool, StoreError> {
        self.store.hdel(LOOKUP_DIRS, uuid).await
    }

    pub async fn entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.store.hgetall(LOOKUP_DIRS).await
    }

    /// Make the registry agree with a capture found at `observed`.
    ///
    /// An existing entry wins while its directory exists, so two instances
    /// racing on the same UUID converge on the same canonical copy.
    pub async fn resolve_conflict(
        &self,
        uuid: &str,
        observed: &Path,
        quarantine: &Quarantine,
    ) -> Result<Resolution, StoreError> {
        if !self.store.hexists(LOOKUP_DIRS, uuid).await? {
            self.register(uuid, observed).await?;
            return Ok(Resolution::Registered);
        }

        let Some(registered) = self.lookup(uuid).await? else {
            // Removed between the two reads.
            self.register(uuid, observed).await?;
            return Ok(Resolution::Registered);
        };
        if registered == observed {
            return Ok(Resolution::Unchanged);
        }

        if registered.exists() {
            let quarantined = quarantine
                .move_capture(observed)
                .map_err(|e| e.to_string());
            return Ok(Resolution::Duplicate {
                canonical: registered,
                quarantined,
            });
        }

        self.register(uuid, observed).await?;
        Ok(Resolution::Corrected { stale: registered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;

    fn setup() -> (tempfile::TempDir, LocationRegistry, Quarantine) {
        let base = tempfile::tempdir().unwrap();
        let quarantine = Quarantine::new(base.path().join("discarded")).unwrap();
        let registry = LocationRegistry::new(Arc::new(MemoryStore::new()));
        (base, registry, quarantine)
    }

    #[tokio::test]
    async fn test_first_sighting_registers() {
        let (base, registry, quarantine) = setup();
        let a = base.path().join("a");
        fs::create_dir_all(&a).unwrap();

        let res = registry.resolve_conflict("u", &a, &quarantine).await.unwrap();
        assert_eq!(res, Resolution::Registered);
        assert_eq!(registry.lookup("u").await.unwrap(), Some(a.clone()));

        let res = registry.resolve_conflict("u", &a, &quarantine).await.unwrap();
        assert_eq!(res, Resolution::Unchanged);
    }

    #[tokio::test]
    async fn test_duplicate_is_quarantined_when_canonical_exists() {
        let (base, registry, quarantine) = setup();
        let a = base.path().join("store").join("a");
        let b = base.path().join("store").join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        registry.register("u", &a).await.unwrap();

        let res = registry.resolve_conflict("u", &b, &quarantine).await.unwrap();
        assert!(!res.is_canonical());
        assert!(!b.exists());
        assert!(quarantine.root().join("b").exists());
        assert_eq!(registry.lookup("u").await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_stale_entry_is_corrected() {
        let (base, registry, quarantine) = setup();
        let a = base.path().join("store").join("a");
        let b = base.path().join("store").join("b");
        fs::create_dir_all(&b).unwrap();
        registry.register("u", &a).await.unwrap();

        let res = registry.resolve_conflict("u", &b, &quarantine).await.unwrap();
        assert_eq!(res, Resolution::Corrected { stale: a });
        assert!(b.exists());
        assert_eq!(registry.lookup("u").await.unwrap(), Some(b));
        assert_eq!(fs::read_dir(quarantine.root()).unwrap().count(), 0);
    }
}
