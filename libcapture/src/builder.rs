use std::path::Path;
use std::sync::Arc;

use crate::capture::Capture;
use crate::events::ReconcileEvent;
use crate::quarantine::Quarantine;
use crate::registry::LocationRegistry;
use crate::tree::{BuildError, Enricher, TreeBuilder};

/// Terminal state of one build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    /// Source data not usable yet; retried on a later pass.
    MissingSource,
    /// Registry and store disagree; left for external repair.
    UuidNotFound,
    /// Another process holds the capture lock; retried on a later pass.
    Locked,
    /// Malformed data; the directory was quarantined and deregistered.
    Malformed,
    /// Any other failure; the directory was quarantined and deregistered.
    Failed,
}

/// Builds the tree of a registry-resolved capture and handles the fallout.
#[derive(Clone)]
pub struct CacheBuilder {
    trees: Arc<dyn TreeBuilder>,
    enricher: Arc<dyn Enricher>,
    registry: LocationRegistry,
    quarantine: Quarantine,
}

impl CacheBuilder {
    pub fn new(
        trees: Arc<dyn TreeBuilder>,
        enricher: Arc<dyn Enricher>,
        registry: LocationRegistry,
        quarantine: Quarantine,
    ) -> Self {
        Self {
            trees,
            enricher,
            registry,
            quarantine,
        }
    }

    pub async fn build(&self, capture: &Capture, events: &mut Vec<ReconcileEvent>) -> BuildOutcome {
        let uuid = capture.uuid.as_str();
        let result = match self.trees.build(uuid).await {
            Ok(_) => self.enricher.enrich(uuid, true).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                push(events, ReconcileEvent::Built {
                    uuid: uuid.to_string(),
                });
                BuildOutcome::Built
            }
            Err(BuildError::UuidNotFound(_)) => {
                push(events, ReconcileEvent::UuidNotFound {
                    uuid: uuid.to_string(),
                });
                BuildOutcome::UuidNotFound
            }
            Err(BuildError::Locked(_)) => {
                push(events, ReconcileEvent::Locked {
                    path: capture.path.clone(),
                });
                BuildOutcome::Locked
            }
            Err(BuildError::NoSourceData { reason, .. }) => {
                push(events, ReconcileEvent::MissingSource {
                    uuid: uuid.to_string(),
                    path: capture.path.clone(),
                    reason,
                });
                BuildOutcome::MissingSource
            }
            Err(BuildError::Malformed { reason, .. }) => {
                push(events, ReconcileEvent::Malformed {
                    uuid: uuid.to_string(),
                    path: capture.path.clone(),
                    reason,
                });
                self.discard(uuid, &capture.path, events).await;
                BuildOutcome::Malformed
            }
            Err(e) => {
                push(events, ReconcileEvent::UnexpectedFailure {
                    uuid: uuid.to_string(),
                    path: capture.path.clone(),
                    reason: e.to_string(),
                });
                self.discard(uuid, &capture.path, events).await;
                BuildOutcome::Failed
            }
        }
    }

    /// Deregister and quarantine a capture that cannot be built.
    async fn discard(&self, uuid: &str, dir: &Path, events: &mut Vec<ReconcileEvent>) {
        if let Err(e) = self.registry.remove(uuid).await {
            push(events, ReconcileEvent::CoordinationFailure {
                reason: format!("unable to deregister {uuid}: {e}"),
            });
        }
        if let Err(e) = self.quarantine.move_capture(dir) {
            push(events, ReconcileEvent::QuarantineFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            });
        }
    }
}

pub(crate) fn push(events: &mut Vec<ReconcileEvent>, event: ReconcileEvent) {
    event.emit();
    events.push(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureStatus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::fs;

    struct Failing(fn(&str) -> BuildError);

    #[async_trait]
    impl TreeBuilder for Failing {
        async fn build(&self, uuid: &str) -> Result<crate::tree::CaptureTree, BuildError> {
            Err((self.0)(uuid))
        }

        async fn remove_artifact(&self, _uuid: &str) -> Result<(), BuildError> {
            Ok(())
        }
    }

    async fn run(failure: fn(&str) -> BuildError) -> (tempfile::TempDir, BuildOutcome, LocationRegistry) {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("store").join("cap");
        fs::create_dir_all(&dir).unwrap();
        let registry = LocationRegistry::new(Arc::new(MemoryStore::new()));
        registry.register("u", &dir).await.unwrap();
        let quarantine = Quarantine::new(base.path().join("discarded")).unwrap();

        let builder = CacheBuilder::new(
            Arc::new(Failing(failure)),
            Arc::new(crate::tree::NoEnrichment),
            registry.clone(),
            quarantine,
        );
        let capture = Capture {
            uuid: "u".into(),
            path: dir,
            status: CaptureStatus::Reconcilable,
        };
        let mut events = Vec::new();
        let outcome = builder.build(&capture, &mut events).await;
        assert_eq!(events.len(), 1);
        (base, outcome, registry)
    }

    #[tokio::test]
    async fn test_missing_source_keeps_capture() {
        let (base, outcome, registry) = run(|uuid| BuildError::NoSourceData {
            uuid: uuid.into(),
            reason: "empty".into(),
        })
        .await;
        assert_eq!(outcome, BuildOutcome::MissingSource);
        assert!(base.path().join("store").join("cap").exists());
        assert!(registry.lookup("u").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unexpected_failure_quarantines_and_deregisters() {
        let (base, outcome, registry) =
            run(|_| BuildError::Other(anyhow::anyhow!("boom"))).await;
        assert_eq!(outcome, BuildOutcome::Failed);
        assert!(!base.path().join("store").join("cap").exists());
        assert!(base.path().join("discarded").join("cap").exists());
        assert!(registry.lookup("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_lost_to_another_builder_keeps_capture() {
        let (base, outcome, registry) = run(|uuid| BuildError::Locked(uuid.into())).await;
        assert_eq!(outcome, BuildOutcome::Locked);
        assert!(base.path().join("store").join("cap").exists());
        assert!(registry.lookup("u").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uuid_not_found_changes_nothing() {
        let (base, outcome, registry) = run(|uuid| BuildError::UuidNotFound(uuid.into())).await;
        assert_eq!(outcome, BuildOutcome::UuidNotFound);
        assert!(base.path().join("store").join("cap").exists());
        assert!(registry.lookup("u").await.unwrap().is_some());
    }
}
