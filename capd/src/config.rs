use anyhow::{Context, Result};
use libcapture::store::XlineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // root of the capture store
    pub capture_dir: PathBuf,
    // defaults to `discarded_captures` next to capture_dir
    #[serde(default)]
    pub discarded_dir: Option<PathBuf>,
    #[serde(default)]
    pub public_instance: bool,
    #[serde(default = "default_sleep_in_sec")]
    pub sleep_in_sec: u64,
    #[serde(default = "default_max_builds_per_pass")]
    pub max_builds_per_pass: usize,
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Xline,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(flatten)]
    pub xline: XlineConfig,
}

fn default_sleep_in_sec() -> u64 {
    60
}

fn default_max_builds_per_pass() -> usize {
    libcapture::reconcile::MAX_BUILDS_PER_PASS
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
