//! Reconciliation of a capture archive against a shared coordination store.
//!
//! A pass walks the capture store, rebuilds missing tree artifacts and keeps
//! the `lookup_dirs` registry canonical; once the backlog is drained the
//! secondary indexes are brought up to date under a TTL lease so that only
//! one daemon instance indexes at a time.

pub mod builder;
pub mod capture;
pub mod coordinator;
pub mod events;
pub mod indexing;
pub mod lease;
pub mod probe;
pub mod quarantine;
pub mod reconcile;
pub mod registry;
pub mod scanner;
pub mod store;
pub mod tree;

pub use builder::{BuildOutcome, CacheBuilder};
pub use capture::{Capture, CaptureStatus, CatalogEntry};
pub use coordinator::{IndexCoordinator, IndexReport};
pub use events::ReconcileEvent;
pub use indexing::{IndexKind, Indexing};
pub use lease::IndexLease;
pub use probe::{ActivityProbe, BuildLock, LockFileProbe};
pub use quarantine::Quarantine;
pub use reconcile::{PassReport, Reconciler};
pub use registry::{LocationRegistry, Resolution};
pub use scanner::StoreScanner;
pub use store::{CoordinationStore, MemoryStore, StoreError, XlineStore};
pub use tree::{BuildError, CaptureTree, Enricher, HarTreeBuilder, NoEnrichment, TreeBuilder};
