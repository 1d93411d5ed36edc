use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// File holding the capture UUID; its presence marks a capture directory.
pub const UUID_MARKER: &str = "uuid";
/// Cached tree artifact, as written by the tree builder.
pub const ARTIFACT_GZ: &str = "tree.json.gz";
/// Uncompressed artifact, accepted when present.
pub const ARTIFACT_PLAIN: &str = "tree.json";
/// Captures carrying this marker are kept out of the indexes on public instances.
pub const NO_INDEX_MARKER: &str = "no_index";

/// What the store currently says about a capture directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// A cached artifact exists.
    Built,
    /// Raw source data exists but no artifact has been derived from it.
    Reconcilable,
    /// Neither artifact nor raw source data.
    NoSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub uuid: String,
    pub path: PathBuf,
    pub status: CaptureStatus,
}

impl Capture {
    /// Read the UUID marker of `dir` and derive its status from the files present.
    pub fn inspect(dir: &Path) -> io::Result<Self> {
        let uuid = fs::read_to_string(dir.join(UUID_MARKER))?.trim().to_string();
        if uuid.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("empty uuid marker in {}", dir.display()),
            ));
        }
        Ok(Self {
            uuid,
            path: dir.to_path_buf(),
            status: status_of(dir),
        })
    }

    pub fn is_reconcilable(&self) -> bool {
        self.status == CaptureStatus::Reconcilable
    }
}

pub fn status_of(dir: &Path) -> CaptureStatus {
    if has_artifact(dir) {
        CaptureStatus::Built
    } else if has_source(dir) {
        CaptureStatus::Reconcilable
    } else {
        CaptureStatus::NoSource
    }
}

pub fn has_artifact(dir: &Path) -> bool {
    dir.join(ARTIFACT_GZ).exists() || dir.join(ARTIFACT_PLAIN).exists()
}

pub fn has_source(dir: &Path) -> bool {
    !source_files(dir).is_empty()
}

/// HAR files (`*.har`, `*.har.gz`) anywhere below `dir`, sorted by path.
pub fn source_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.ends_with(".har") || name.ends_with(".har.gz")
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// One capture as seen by the indexing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub uuid: String,
    pub path: PathBuf,
    pub no_index: bool,
}

impl CatalogEntry {
    pub fn new(uuid: String, path: PathBuf) -> Self {
        let no_index = path.join(NO_INDEX_MARKER).exists();
        Self {
            uuid,
            path,
            no_index,
        }
    }
}

/// Build the capture catalog from registry entries, most recent first.
pub fn catalog(entries: Vec<(String, String)>) -> Vec<CatalogEntry> {
    let mut catalog: Vec<CatalogEntry> = entries
        .into_iter()
        .map(|(uuid, path)| CatalogEntry::new(uuid, PathBuf::from(path)))
        .collect();
    catalog.sort_by(|a, b| b.path.cmp(&a.path));
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(UUID_MARKER), "abc\n")?;

        let capture = Capture::inspect(dir.path())?;
        assert_eq!(capture.uuid, "abc");
        assert_eq!(capture.status, CaptureStatus::NoSource);

        fs::create_dir(dir.path().join("0"))?;
        fs::write(dir.path().join("0").join("0.har"), "{}")?;
        assert_eq!(status_of(dir.path()), CaptureStatus::Reconcilable);

        fs::write(dir.path().join(ARTIFACT_GZ), b"")?;
        assert_eq!(status_of(dir.path()), CaptureStatus::Built);
        Ok(())
    }

    #[test]
    fn test_empty_uuid_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(UUID_MARKER), "  \n")?;
        assert!(Capture::inspect(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_catalog_is_most_recent_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let old = dir.path().join("2024-01-01");
        let new = dir.path().join("2024-06-01");
        fs::create_dir_all(&old)?;
        fs::create_dir_all(&new)?;
        fs::write(new.join(NO_INDEX_MARKER), "")?;

        let entries = catalog(vec![
            ("old".into(), old.display().to_string()),
            ("new".into(), new.display().to_string()),
        ]);
        assert_eq!(entries[0].uuid, "new");
        assert!(entries[0].no_index);
        assert!(!entries[1].no_index);
        Ok(())
    }
}
