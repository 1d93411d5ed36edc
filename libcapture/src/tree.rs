use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tempfile::NamedTempFile;

use crate::capture::{ARTIFACT_GZ, ARTIFACT_PLAIN, source_files};
use crate::probe::BuildLock;
use crate::registry::LocationRegistry;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("capture {0} is not in the location registry")]
    UuidNotFound(String),
    #[error("no source data for capture {uuid}: {reason}")]
    NoSourceData { uuid: String, reason: String },
    #[error("malformed data for capture {uuid}: {reason}")]
    Malformed { uuid: String, reason: String },
    #[error("capture {0} is locked by another process")]
    Locked(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Navigable view of one capture, one node per recorded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTree {
    pub uuid: String,
    pub nodes: Vec<UrlNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlNode {
    pub url: String,
    /// SHA-512 of the response body, when a body was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hash: Option<String>,
    /// Names of the cookies set by the response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<String>,
    /// HTTP header hash of the response, when it carried headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hhhash: Option<String>,
}

/// Produces the tree of a capture, from its cached artifact or its raw data.
#[async_trait]
pub trait TreeBuilder: Send + Sync {
    async fn build(&self, uuid: &str) -> Result<CaptureTree, BuildError>;

    /// Delete the cached artifact so the capture is rebuilt on a later pass.
    async fn remove_artifact(&self, uuid: &str) -> Result<(), BuildError>;
}

/// Post-build enrichment hook, run after every successful build.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, uuid: &str, auto_triggered: bool) -> Result<(), BuildError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl Enricher for NoEnrichment {
    async fn enrich(&self, _uuid: &str, _auto_triggered: bool) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Tree builder over the HAR files of a capture directory.
#[derive(Clone)]
pub struct HarTreeBuilder {
    registry: LocationRegistry,
}

impl HarTreeBuilder {
    pub fn new(registry: LocationRegistry) -> Self {
        Self { registry }
    }

    async fn capture_dir(&self, uuid: &str) -> Result<PathBuf, BuildError> {
        match self.registry.lookup(uuid).await? {
            Some(dir) if dir.exists() => Ok(dir),
            _ => Err(BuildError::UuidNotFound(uuid.to_string())),
        }
    }
}

#[async_trait]
impl TreeBuilder for HarTreeBuilder {
    async fn build(&self, uuid: &str) -> Result<CaptureTree, BuildError> {
        let dir = self.capture_dir(uuid).await?;
        let owned = uuid.to_string();
        tokio::task::spawn_blocking(move || build_in(&owned, &dir))
            .await
            .map_err(|e| BuildError::Other(anyhow::anyhow!("tree build task failed: {e}")))?
    }

    async fn remove_artifact(&self, uuid: &str) -> Result<(), BuildError> {
        let dir = self.capture_dir(uuid).await?;
        for name in [ARTIFACT_GZ, ARTIFACT_PLAIN] {
            match fs::remove_file(dir.join(name)) {
                Ok(()) => debug!("Removed {name} of {uuid}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Load or derive the tree of the capture in `dir`, holding its lock while deriving.
fn build_in(uuid: &str, dir: &Path) -> Result<CaptureTree, BuildError> {
    if let Some(tree) = load_artifact(uuid, dir)? {
        return Ok(tree);
    }

    let Some(_lock) = BuildLock::acquire(dir)? else {
        return Err(BuildError::Locked(uuid.to_string()));
    };
    // Another instance may have finished between the first check and the lock.
    if let Some(tree) = load_artifact(uuid, dir)? {
        return Ok(tree);
    }

    let hars = source_files(dir);
    if hars.is_empty() {
        return Err(BuildError::NoSourceData {
            uuid: uuid.to_string(),
            reason: format!("no HAR file in {}", dir.display()),
        });
    }

    let mut nodes = Vec::new();
    for har_path in &hars {
        let har = read_har(har_path).map_err(|e| BuildError::Malformed {
            uuid: uuid.to_string(),
            reason: format!("{}: {e}", har_path.display()),
        })?;
        nodes.extend(har.log.entries.iter().map(UrlNode::from_entry));
    }

    let tree = CaptureTree {
        uuid: uuid.to_string(),
        nodes,
    };
    write_artifact(dir, &tree)?;
    info!("Built tree for {uuid} ({} nodes)", tree.nodes.len());
    Ok(tree)
}

/// Decode the cached artifact of `dir`, `Ok(None)` when there is none.
pub fn load_artifact(uuid: &str, dir: &Path) -> Result<Option<CaptureTree>, BuildError> {
    let malformed = |name: &str, e: &dyn std::fmt::Display| BuildError::Malformed {
        uuid: uuid.to_string(),
        reason: format!("{name}: {e}"),
    };

    if let Some(file) = open_existing(&dir.join(ARTIFACT_GZ))? {
        let reader = BufReader::new(GzDecoder::new(file));
        let tree: CaptureTree =
            serde_json::from_reader(reader).map_err(|e| malformed(ARTIFACT_GZ, &e))?;
        return Ok(Some(tree));
    }

    if let Some(file) = open_existing(&dir.join(ARTIFACT_PLAIN))? {
        let reader = BufReader::new(file);
        let tree: CaptureTree =
            serde_json::from_reader(reader).map_err(|e| malformed(ARTIFACT_PLAIN, &e))?;
        return Ok(Some(tree));
    }
    Ok(None)
}

fn open_existing(path: &Path) -> io::Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write `tree.json.gz` through a uniquely named temporary file in `dir`, so
/// readers never see half an artifact and concurrent writers never share one.
pub fn write_artifact(dir: &Path, tree: &CaptureTree) -> Result<(), BuildError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file_mut()), Compression::default());
        serde_json::to_writer(&mut encoder, tree).map_err(anyhow::Error::from)?;
        encoder.finish()?.flush()?;
    }
    tmp.persist(dir.join(ARTIFACT_GZ)).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Har {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    request: HarRequest,
    response: HarResponse,
}

#[derive(Debug, Deserialize)]
struct HarRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
struct HarResponse {
    #[serde(default)]
    headers: Vec<HarNameValue>,
    #[serde(default)]
    cookies: Vec<HarNameValue>,
    #[serde(default)]
    content: HarContent,
}

#[derive(Debug, Deserialize)]
struct HarNameValue {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct HarContent {
    text: Option<String>,
}

fn read_har(path: &Path) -> anyhow::Result<Har> {
    let file = File::open(path)?;
    let is_gz = path.to_string_lossy().ends_with(".gz");
    let mut raw = Vec::new();
    if is_gz {
        GzDecoder::new(file).read_to_end(&mut raw)?;
    } else {
        BufReader::new(file).read_to_end(&mut raw)?;
    }
    Ok(serde_json::from_slice(&raw)?)
}

impl UrlNode {
    fn from_entry(entry: &HarEntry) -> Self {
        let body_hash = entry
            .response
            .content
            .text
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| hex::encode(Sha512::digest(t.as_bytes())));

        let header_names: Vec<&str> = entry
            .response
            .headers
            .iter()
            .map(|h| h.name.as_str())
            .collect();

        Self {
            url: entry.request.url.clone(),
            body_hash,
            cookies: entry
                .response
                .cookies
                .iter()
                .map(|c| c.name.clone())
                .collect(),
            hhhash: hhhash(&header_names),
        }
    }
}

/// `hhh:1:` followed by the SHA-256 of the header names joined with `:`.
pub fn hhhash(header_names: &[&str]) -> Option<String> {
    if header_names.is_empty() {
        return None;
    }
    let digest = Sha256::digest(header_names.join(":").as_bytes());
    Some(format!("hhh:1:{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const HAR: &str = r#"{"log": {"entries": [
        {"request": {"url": "https://example.com/"},
         "response": {
            "headers": [{"name": "Server", "value": "x"}, {"name": "Set-Cookie", "value": "sid=1"}],
            "cookies": [{"name": "sid", "value": "1"}],
            "content": {"text": "<html></html>"}}},
        {"request": {"url": "https://example.com/empty"},
         "response": {"content": {}}}
    ]}}"#;

    async fn registered_capture(har: &str) -> (tempfile::TempDir, HarTreeBuilder) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0.har"), har).unwrap();
        let registry = LocationRegistry::new(Arc::new(MemoryStore::new()));
        registry.register("u1", dir.path()).await.unwrap();
        (dir, HarTreeBuilder::new(registry))
    }

    #[tokio::test]
    async fn test_build_writes_artifact() {
        let (dir, builder) = registered_capture(HAR).await;
        let tree = builder.build("u1").await.unwrap();
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.nodes[0].cookies, vec!["sid".to_string()]);
        assert!(tree.nodes[0].body_hash.as_ref().is_some_and(|h| h.len() == 128));
        assert!(tree.nodes[0].hhhash.as_ref().is_some_and(|h| h.starts_with("hhh:1:")));
        assert_eq!(tree.nodes[1].body_hash, None);
        assert!(dir.path().join(ARTIFACT_GZ).exists());

        // The second call reads the artifact back.
        fs::remove_file(dir.path().join("0.har")).unwrap();
        assert_eq!(builder.build("u1").await.unwrap(), tree);
    }

    #[tokio::test]
    async fn test_unknown_uuid() {
        let (_dir, builder) = registered_capture(HAR).await;
        assert!(matches!(
            builder.build("nope").await,
            Err(BuildError::UuidNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_har_is_malformed() {
        let (_dir, builder) = registered_capture("{ not json").await;
        assert!(matches!(
            builder.build("u1").await,
            Err(BuildError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_malformed_and_removable() {
        let (dir, builder) = registered_capture(HAR).await;
        fs::write(dir.path().join(ARTIFACT_GZ), b"definitely not gzip").unwrap();
        assert!(matches!(
            builder.build("u1").await,
            Err(BuildError::Malformed { .. })
        ));

        builder.remove_artifact("u1").await.unwrap();
        assert!(!dir.path().join(ARTIFACT_GZ).exists());
        assert!(builder.build("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_build_leaves_no_lock_or_temp_file() {
        let (dir, builder) = registered_capture(HAR).await;
        builder.build("u1").await.unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0.har".to_string(), ARTIFACT_GZ.to_string()]);
    }

    #[tokio::test]
    async fn test_locked_capture_is_not_built() {
        let (dir, builder) = registered_capture(HAR).await;
        let lock = BuildLock::acquire(dir.path()).unwrap().unwrap();
        assert!(matches!(
            builder.build("u1").await,
            Err(BuildError::Locked(_))
        ));
        assert!(!dir.path().join(ARTIFACT_GZ).exists());

        drop(lock);
        assert!(builder.build("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_artifact_wins_over_lock() {
        let (dir, builder) = registered_capture(HAR).await;
        let tree = builder.build("u1").await.unwrap();
        let _lock = BuildLock::acquire(dir.path()).unwrap().unwrap();
        assert_eq!(builder.build("u1").await.unwrap(), tree);
    }

    #[test]
    fn test_hhhash_depends_on_header_order() {
        assert_ne!(hhhash(&["A", "B"]), hhhash(&["B", "A"]));
        assert_eq!(hhhash(&[]), None);
    }
}
