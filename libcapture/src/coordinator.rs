use std::sync::Arc;

use log::{error, info, warn};

use crate::capture::{CatalogEntry, catalog};
use crate::indexing::{IndexKind, Indexing};
use crate::lease::IndexLease;
use crate::registry::LocationRegistry;
use crate::store::StoreError;
use crate::tree::{BuildError, TreeBuilder};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// False when another instance held the lease and nothing ran.
    pub ran: bool,
    /// Captures that got at least one new index, with the kinds built.
    pub indexed: Vec<(String, Vec<IndexKind>)>,
    /// Captures whose artifact was malformed and got deleted.
    pub broken: Vec<String>,
    /// Captures left for a later pass (tree unavailable, index write failed).
    pub deferred: Vec<String>,
}

/// Brings the secondary indexes up to date, one instance at a time.
pub struct IndexCoordinator {
    lease: IndexLease,
    indexing: Indexing,
    registry: LocationRegistry,
    trees: Arc<dyn TreeBuilder>,
    public_instance: bool,
}

impl IndexCoordinator {
    pub fn new(
        lease: IndexLease,
        indexing: Indexing,
        registry: LocationRegistry,
        trees: Arc<dyn TreeBuilder>,
    ) -> Self {
        Self {
            lease,
            indexing,
            registry,
            trees,
            public_instance: false,
        }
    }

    /// On a public instance, captures marked `no_index` stay out of the indexes.
    pub fn public_instance(mut self, public: bool) -> Self {
        self.public_instance = public;
        self
    }

    /// Run one indexing pass if the lease can be taken.
    ///
    /// Callers only invoke this once a reconciliation pass exhausted the
    /// backlog. Errors are only returned for the lease itself; the lease is
    /// released whatever happened inside the pass.
    pub async fn run(&self) -> Result<IndexReport, StoreError> {
        if !self.lease.acquire().await? {
            info!("Indexing already ongoing in another process.");
            return Ok(IndexReport::default());
        }

        info!("Check indexes...");
        let report = self.index_catalog().await;
        self.lease.release().await?;
        info!("... done.");
        Ok(report)
    }

    async fn index_catalog(&self) -> IndexReport {
        let mut report = IndexReport {
            ran: true,
            ..Default::default()
        };

        let entries = match self.registry.entries().await {
            Ok(entries) => catalog(entries),
            Err(e) => {
                error!("Unable to read the capture catalog: {e}");
                return report;
            }
        };

        for entry in entries {
            if self.public_instance && entry.no_index {
                continue;
            }
            self.index_capture(&entry, &mut report).await;
        }
        report
    }

    async fn index_capture(&self, entry: &CatalogEntry, report: &mut IndexReport) {
        let uuid = entry.uuid.as_str();
        let flags = match self.indexing.flags(uuid).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!("Unable to read index flags of {uuid}: {e}");
                report.deferred.push(uuid.to_string());
                return;
            }
        };
        if flags.all() {
            return;
        }

        let tree = match self.trees.build(uuid).await {
            Ok(tree) => tree,
            Err(BuildError::Malformed { reason, .. }) => {
                warn!("Broken tree artifact for {uuid}: {reason}");
                if let Err(e) = self.trees.remove_artifact(uuid).await {
                    error!("Unable to remove the artifact of {uuid}: {e}");
                }
                report.broken.push(uuid.to_string());
                return;
            }
            Err(e) => {
                warn!("No tree for {uuid}, not indexing it now: {e}");
                report.deferred.push(uuid.to_string());
                return;
            }
        };

        let mut built = Vec::new();
        for kind in flags.missing() {
            info!("Indexing {kind} for {uuid}");
            match self.indexing.index(kind, &tree).await {
                Ok(()) => built.push(kind),
                Err(e) => {
                    error!("Unable to index {kind} for {uuid}: {e}");
                    if !report.deferred.iter().any(|d| d == uuid) {
                        report.deferred.push(uuid.to_string());
                    }
                }
            }
        }
        if !built.is_empty() {
            report.indexed.push((uuid.to_string(), built));
        }
    }
}
