//! Hardware-control context
//!
//! The device manager never talks to PMEM hardware directly. It goes through an
//! [`NdctlContext`], which is the boundary to the namespace control facility:
//!
//! - `cli` - drives the system `ndctl` tool and parses its JSON output
//! - `emulated` - file-backed stand-in for PMEM regions, used without hardware
//!
//! Contexts are not safe for concurrent entry. Callers must serialize every
//! call; `NdctlDeviceManager` does so with its single lock.

pub mod cli;
pub mod emulated;

pub use cli::CliContext;
pub use emulated::{EmulatedContext, RegionSpec};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Alignment used for every namespace creation request (1 GiB).
///
/// Smaller alignments work on newer kernels, but 1 GiB is accepted everywhere.
pub const NDCTL_ALIGN: u64 = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum NdctlError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unparsable ndctl output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid namespace mode: {0}")]
    InvalidMode(String),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("no region can hold {requested} bytes (largest free extent {available})")]
    NoSpace { requested: u64, available: u64 },
}

/// Allocation personality of a namespace.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    /// Direct byte-addressable access (filesystem DAX)
    #[default]
    Fsdax,
    /// Sector-emulated access through the block translation table
    Sector,
}

impl NamespaceMode {
    /// Every mode the manager reports capacity for and accepts on create.
    pub const SUPPORTED: [NamespaceMode; 2] = [NamespaceMode::Fsdax, NamespaceMode::Sector];

    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceMode::Fsdax => "fsdax",
            NamespaceMode::Sector => "sector",
        }
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceMode {
    type Err = NdctlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fsdax" => Ok(NamespaceMode::Fsdax),
            "sector" => Ok(NamespaceMode::Sector),
            _ => Err(NdctlError::InvalidMode(s.to_string())),
        }
    }
}

/// A span of persistent memory striped across `interleave_ways` devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub dev: String,
    pub interleave_ways: u64,
    pub max_available_extent: u64,
}

/// Topological grouping of active regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub dev: String,
    pub regions: Vec<Region>,
}

/// An active namespace as reported by the control facility.
///
/// Every active namespace is reported, including ones this crate cannot hand
/// out (devdax, raw, or left half-configured by a failed create): they still
/// hold their name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Caller-chosen name; the volume id
    pub name: String,
    /// Namespace device, e.g. `namespace0.1`
    pub dev: String,
    /// Block device node name, e.g. `pmem0.1`
    pub blockdev: Option<String>,
    /// Usable size in bytes
    pub size: u64,
    /// `None` for modes other than fsdax and sector
    pub mode: Option<NamespaceMode>,
}

impl Namespace {
    /// True when the namespace is in a supported mode and has a block device.
    pub fn is_managed(&self) -> bool {
        self.mode.is_some() && self.blockdev.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNamespaceOpts {
    pub name: String,
    pub size: u64,
    pub align: u64,
    pub mode: NamespaceMode,
}

/// Access to the namespace control facility.
///
/// Implementations may assume they are never entered concurrently.
pub trait NdctlContext: Send {
    /// All buses with their active regions.
    fn buses(&self) -> Result<Vec<Bus>, NdctlError>;

    /// All active namespaces, in enumeration order.
    fn active_namespaces(&self) -> Result<Vec<Namespace>, NdctlError>;

    /// Looks up an active namespace by its name.
    fn namespace_by_name(&self, name: &str) -> Result<Option<Namespace>, NdctlError> {
        Ok(self
            .active_namespaces()?
            .into_iter()
            .find(|ns| ns.name == name))
    }

    fn create_namespace(&mut self, opts: CreateNamespaceOpts) -> Result<Namespace, NdctlError>;

    fn destroy_namespace_by_name(&mut self, name: &str) -> Result<(), NdctlError>;

    /// Resolves a namespace to the path of its block device node, if it has one.
    fn device_path(&self, ns: &Namespace) -> Option<PathBuf> {
        ns.blockdev.as_ref().map(|blockdev| Path::new("/dev").join(blockdev))
    }
}
