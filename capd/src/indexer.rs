use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use libcapture::{
    CacheBuilder, CoordinationStore, HarTreeBuilder, IndexCoordinator, IndexLease, Indexing,
    LocationRegistry, LockFileProbe, MemoryStore, NoEnrichment, Quarantine, Reconciler,
    StoreScanner, XlineStore,
};
use log::{error, info, warn};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{Backend, Config, CoordinationConfig};

pub const SCRIPT_NAME: &str = "background_indexer";
pub const HEARTBEAT_HASH: &str = "tree_cache";

/// What one round did, also stored as the heartbeat value.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub last_run: DateTime<Utc>,
    pub exhausted_backlog: bool,
    pub attempted: usize,
    pub quarantined: usize,
    /// `None` when indexing did not run this round.
    pub indexed: Option<usize>,
}

pub async fn open_store(cfg: &CoordinationConfig) -> Result<Arc<dyn CoordinationStore>> {
    match cfg.backend {
        Backend::Memory => {
            warn!("Using the in-memory coordination store, state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        Backend::Xline => {
            if cfg.xline.endpoints.is_empty() {
                bail!("coordination.endpoints is required for the xline backend");
            }
            let store = XlineStore::new(&cfg.xline)
                .await
                .context("Failed to connect to the coordination store")?;
            Ok(Arc::new(store))
        }
    }
}

pub struct BackgroundIndexer {
    store: Arc<dyn CoordinationStore>,
    reconciler: Reconciler,
    coordinator: IndexCoordinator,
    sleep: Duration,
}

impl BackgroundIndexer {
    pub fn new(cfg: &Config, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        let quarantine = match &cfg.discarded_dir {
            Some(dir) => Quarantine::new(dir),
            None => Quarantine::beside(&cfg.capture_dir),
        }
        .context("Failed to create the quarantine directory")?;

        let registry = LocationRegistry::new(store.clone());
        let trees = Arc::new(HarTreeBuilder::new(registry.clone()));
        let builder = CacheBuilder::new(
            trees.clone(),
            Arc::new(NoEnrichment),
            registry.clone(),
            quarantine.clone(),
        );
        let reconciler = Reconciler::new(
            StoreScanner::new(&cfg.capture_dir),
            Arc::new(LockFileProbe::default()),
            registry.clone(),
            quarantine,
            builder,
        )
        .with_max_builds(cfg.max_builds_per_pass);
        let coordinator = IndexCoordinator::new(
            IndexLease::new(store.clone()),
            Indexing::new(store.clone()),
            registry,
            trees,
        )
        .public_instance(cfg.public_instance);

        Ok(Self {
            store,
            reconciler,
            coordinator,
            sleep: Duration::from_secs(cfg.sleep_in_sec),
        })
    }

    /// Reconcile, index if the backlog is drained, then write the heartbeat.
    pub async fn run_once(&self) -> RoundSummary {
        let pass = self.reconciler.run_pass().await;

        let indexed = if pass.exhausted_backlog {
            match self.coordinator.run().await {
                Ok(report) if report.ran => Some(report.indexed.len()),
                Ok(_) => None,
                Err(e) => {
                    error!("Indexing pass failed on the lease: {e}");
                    None
                }
            }
        } else {
            None
        };

        let summary = RoundSummary {
            last_run: Utc::now(),
            exhausted_backlog: pass.exhausted_backlog,
            attempted: pass.attempted,
            quarantined: pass.quarantined(),
            indexed,
        };
        if let Err(e) = self.heartbeat(&summary).await {
            warn!("Unable to write heartbeat: {e:#}");
        }
        summary
    }

    /// Loop until `cancel` fires, sleeping between rounds.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting {SCRIPT_NAME}, sleeping {}s between rounds", self.sleep.as_secs());
        while !cancel.is_cancelled() {
            let summary = self.run_once().await;
            info!(
                "Round done: {} built, {} quarantined, backlog exhausted: {}",
                summary.attempted, summary.quarantined, summary.exhausted_backlog
            );

            tokio::select! {
                _ = sleep(self.sleep) => {},
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                }
            }
        }
        info!("{SCRIPT_NAME} stopped");
        Ok(())
    }

    async fn heartbeat(&self, summary: &RoundSummary) -> Result<()> {
        let field = format!("{}|{SCRIPT_NAME}", std::process::id());
        let value = serde_json::to_string(summary)?;
        self.store.hset(HEARTBEAT_HASH, &field, &value).await?;
        Ok(())
    }
}
