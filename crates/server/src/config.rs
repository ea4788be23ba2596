use anyhow::{Context, Result};
use pmd_core::clear::DEFAULT_CLEAR_BYTES;
use pmd_core::mount::PROC_MOUNTS;
use pmd_core::ndctl::NDCTL_ALIGN;
use pmd_core::RegionSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which hardware-control context backs the manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// System `ndctl` tool
    #[default]
    Ndctl,
    /// File-backed namespaces under `emulated_root`
    Emulated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_ndctl_binary")]
    pub ndctl_binary: PathBuf,

    #[serde(default = "default_emulated_root")]
    pub emulated_root: PathBuf,

    #[serde(default = "default_emulated_regions")]
    pub emulated_regions: Vec<RegionSpec>,

    /// Namespace alignment in bytes
    #[serde(default = "default_align")]
    pub align: u64,

    /// Mount table checked for a read-only `/sys` (ndctl backend only)
    #[serde(default = "default_mounts")]
    pub mounts: PathBuf,

    /// Bytes zeroed at the start of a device when not flushing
    #[serde(default = "default_clear_bytes")]
    pub clear_bytes: u64,

    /// Outer limit on a single operation; none waits forever
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_ndctl_binary() -> PathBuf {
    PathBuf::from("ndctl")
}

fn default_emulated_root() -> PathBuf {
    PathBuf::from("/var/lib/pmd/emulated")
}

fn default_emulated_regions() -> Vec<RegionSpec> {
    vec![RegionSpec::new(16 * NDCTL_ALIGN, 1)]
}

fn default_align() -> u64 {
    NDCTL_ALIGN
}

fn default_mounts() -> PathBuf {
    PathBuf::from(PROC_MOUNTS)
}

fn default_clear_bytes() -> u64 {
    DEFAULT_CLEAR_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ndctl_binary: default_ndctl_binary(),
            emulated_root: default_emulated_root(),
            emulated_regions: default_emulated_regions(),
            align: default_align(),
            mounts: default_mounts(),
            clear_bytes: default_clear_bytes(),
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}
