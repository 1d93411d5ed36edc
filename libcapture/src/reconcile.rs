use std::sync::Arc;

use log::{error, info};

use crate::builder::{CacheBuilder, push};
use crate::capture::CaptureStatus;
use crate::events::ReconcileEvent;
use crate::probe::ActivityProbe;
use crate::quarantine::Quarantine;
use crate::registry::{LocationRegistry, Resolution};
use crate::scanner::StoreScanner;

/// Build attempts per pass before starting over from the newest capture.
pub const MAX_BUILDS_PER_PASS: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// The scan ran to the end without hitting the batch limit.
    pub exhausted_backlog: bool,
    /// Registry-resolved candidates handed to the cache builder.
    pub attempted: usize,
    pub events: Vec<ReconcileEvent>,
}

impl PassReport {
    pub fn quarantined(&self) -> usize {
        self.events.iter().filter(|e| e.is_quarantine()).count()
    }
}

pub struct Reconciler {
    scanner: StoreScanner,
    probe: Arc<dyn ActivityProbe>,
    registry: LocationRegistry,
    quarantine: Quarantine,
    builder: CacheBuilder,
    max_builds: usize,
}

impl Reconciler {
    pub fn new(
        scanner: StoreScanner,
        probe: Arc<dyn ActivityProbe>,
        registry: LocationRegistry,
        quarantine: Quarantine,
        builder: CacheBuilder,
    ) -> Self {
        Self {
            scanner,
            probe,
            registry,
            quarantine,
            builder,
            max_builds: MAX_BUILDS_PER_PASS,
        }
    }

    pub fn with_max_builds(mut self, max_builds: usize) -> Self {
        self.max_builds = max_builds.max(1);
        self
    }

    /// Run one bounded pass over the capture store.
    ///
    /// Never fails: every error is handled per candidate and reported as an
    /// event. A coordination store failure ends the pass early and reports
    /// the backlog as not exhausted.
    pub async fn run_pass(&self) -> PassReport {
        info!("Build missing trees...");
        let mut report = PassReport::default();

        let candidates = match self.scanner.scan_blocking().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Capture store walk aborted: {e}");
                return report;
            }
        };

        for capture in candidates {
            match capture.status {
                CaptureStatus::Built => {
                    push(&mut report.events, ReconcileEvent::AlreadyBuilt {
                        path: capture.path,
                    });
                    continue;
                }
                CaptureStatus::NoSource => {
                    push(&mut report.events, ReconcileEvent::NoSource {
                        path: capture.path,
                    });
                    continue;
                }
                CaptureStatus::Reconcilable => {}
            }

            if self.probe.is_active(&capture.path) {
                push(&mut report.events, ReconcileEvent::Locked {
                    path: capture.path,
                });
                continue;
            }

            let resolution = match self
                .registry
                .resolve_conflict(&capture.uuid, &capture.path, &self.quarantine)
                .await
            {
                Ok(resolution) => resolution,
                Err(e) => {
                    push(&mut report.events, ReconcileEvent::CoordinationFailure {
                        reason: format!("unable to resolve {}: {e}", capture.uuid),
                    });
                    info!("... coordination store unavailable, stopping this pass.");
                    return report;
                }
            };

            match resolution {
                Resolution::Unchanged => {}
                Resolution::Registered => push(&mut report.events, ReconcileEvent::Registered {
                    uuid: capture.uuid.clone(),
                    path: capture.path.clone(),
                }),
                Resolution::Corrected { stale } => {
                    push(&mut report.events, ReconcileEvent::StaleEntryCorrected {
                        uuid: capture.uuid.clone(),
                        stale,
                        path: capture.path.clone(),
                    })
                }
                Resolution::Duplicate {
                    canonical,
                    quarantined,
                } => {
                    push(&mut report.events, ReconcileEvent::DuplicateUuid {
                        uuid: capture.uuid.clone(),
                        canonical,
                        duplicate: capture.path.clone(),
                    });
                    if let Err(reason) = quarantined {
                        push(&mut report.events, ReconcileEvent::QuarantineFailed {
                            path: capture.path,
                            reason,
                        });
                    }
                    continue;
                }
            }

            report.attempted += 1;
            info!(
                "Build tree for {}: {}",
                capture.uuid,
                capture
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy())
                    .unwrap_or_default()
            );
            self.builder.build(&capture, &mut report.events).await;

            if report.attempted >= self.max_builds {
                info!("... too many captures in the backlog, start from the beginning.");
                return report;
            }
        }

        info!("... done.");
        report.exhausted_backlog = true;
        report
    }
}
