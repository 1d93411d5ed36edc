use std::fmt;
use std::path::PathBuf;

use log::Level;

/// Everything a reconciliation pass can observe about one candidate.
///
/// Each kind carries a fixed severity; the severity is the operator signal,
/// `Level::Error` standing for the critical cases that end in quarantine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    AlreadyBuilt {
        path: PathBuf,
    },
    NoSource {
        path: PathBuf,
    },
    Locked {
        path: PathBuf,
    },
    Registered {
        uuid: String,
        path: PathBuf,
    },
    StaleEntryCorrected {
        uuid: String,
        stale: PathBuf,
        path: PathBuf,
    },
    DuplicateUuid {
        uuid: String,
        canonical: PathBuf,
        duplicate: PathBuf,
    },
    Built {
        uuid: String,
    },
    MissingSource {
        uuid: String,
        path: PathBuf,
        reason: String,
    },
    UuidNotFound {
        uuid: String,
    },
    Malformed {
        uuid: String,
        path: PathBuf,
        reason: String,
    },
    UnexpectedFailure {
        uuid: String,
        path: PathBuf,
        reason: String,
    },
    QuarantineFailed {
        path: PathBuf,
        reason: String,
    },
    CoordinationFailure {
        reason: String,
    },
}

impl ReconcileEvent {
    pub fn severity(&self) -> Level {
        use ReconcileEvent::*;
        match self {
            AlreadyBuilt { .. } | NoSource { .. } | Locked { .. } | Registered { .. } => {
                Level::Debug
            }
            Built { .. } => Level::Info,
            StaleEntryCorrected { .. } | MissingSource { .. } | UuidNotFound { .. } => {
                Level::Warn
            }
            DuplicateUuid { .. }
            | Malformed { .. }
            | UnexpectedFailure { .. }
            | QuarantineFailed { .. }
            | CoordinationFailure { .. } => Level::Error,
        }
    }

    /// Whether the event ends with the capture directory leaving the store.
    pub fn is_quarantine(&self) -> bool {
        matches!(
            self,
            ReconcileEvent::DuplicateUuid { .. }
                | ReconcileEvent::Malformed { .. }
                | ReconcileEvent::UnexpectedFailure { .. }
        )
    }

    pub fn emit(&self) {
        log::log!(target: "capture::reconcile", self.severity(), "{self}");
    }
}

impl fmt::Display for ReconcileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ReconcileEvent::*;
        match self {
            AlreadyBuilt { path } => write!(f, "{} has a tree artifact", path.display()),
            NoSource { path } => write!(f, "{} has no HAR file", path.display()),
            Locked { path } => write!(
                f,
                "{} is locked, the tree is built by another process",
                path.display()
            ),
            Registered { uuid, path } => {
                write!(f, "registered {uuid} at {}", path.display())
            }
            StaleEntryCorrected { uuid, stale, path } => write!(
                f,
                "registered path {} for {uuid} is gone, now {}",
                stale.display(),
                path.display()
            ),
            DuplicateUuid {
                uuid,
                canonical,
                duplicate,
            } => write!(
                f,
                "duplicate UUID for {uuid} in {} and {}, discarding the latest",
                canonical.display(),
                duplicate.display()
            ),
            Built { uuid } => write!(f, "tree for {uuid} built"),
            MissingSource { uuid, path, reason } => write!(
                f,
                "no usable source data in capture {uuid}: {} - {reason}",
                path.display()
            ),
            UuidNotFound { uuid } => write!(f, "unable to find {uuid}, that should not happen"),
            Malformed { uuid, path, reason } => write!(
                f,
                "malformed capture {uuid}: {} - {reason}",
                path.display()
            ),
            UnexpectedFailure { uuid, path, reason } => write!(
                f,
                "unable to build tree for {uuid}: {} - {reason}",
                path.display()
            ),
            QuarantineFailed { path, reason } => {
                write!(f, "unable to quarantine {}: {reason}", path.display())
            }
            CoordinationFailure { reason } => {
                write!(f, "coordination store failure: {reason}")
            }
        }
    }
}
