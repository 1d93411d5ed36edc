use std::path::{Path, PathBuf};

use log::{error, warn};
use tokio::task::{self, JoinError};
use walkdir::WalkDir;

use crate::capture::{Capture, UUID_MARKER};

/// Walks the capture store for directories carrying a `uuid` marker.
#[derive(Debug, Clone)]
pub struct StoreScanner {
    root: PathBuf,
}

impl StoreScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidates in reverse path order, newest captures first.
    ///
    /// Every call walks the store again. Marker paths are collected up front
    /// to order them; reading each capture happens as the iterator is consumed.
    pub fn scan(&self) -> impl Iterator<Item = Capture> {
        inspect_all(self.markers())
    }

    /// [`scan`](Self::scan) with the directory walk run on the blocking pool.
    pub async fn scan_blocking(&self) -> Result<impl Iterator<Item = Capture>, JoinError> {
        let scanner = self.clone();
        let markers = task::spawn_blocking(move || scanner.markers()).await?;
        Ok(inspect_all(markers))
    }

    fn markers(&self) -> Vec<PathBuf> {
        let mut markers: Vec<PathBuf> = Vec::new();
        for entry_result in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(err) => {
                    error!("Error in walkdir: {err}");
                    continue;
                }
            };
            if entry.file_type().is_file() && entry.file_name() == UUID_MARKER {
                markers.push(entry.into_path());
            }
        }
        markers.sort_unstable_by(|a, b| b.cmp(a));
        markers
    }
}

fn inspect_all(markers: Vec<PathBuf>) -> impl Iterator<Item = Capture> {
    markers.into_iter().filter_map(|marker| {
        let dir = marker.parent()?;
        match Capture::inspect(dir) {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!("Unable to read capture in {}: {e}", dir.display());
                None
            }
        }
    })
}
