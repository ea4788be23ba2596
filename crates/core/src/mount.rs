//! Mount table access for the startup guard
//!
//! The control facility writes through sysfs. A `/sys` mounted read-only (as
//! in some unprivileged containers) makes every namespace operation fail, and
//! the condition cannot change for the lifetime of the process, so it is
//! checked once before the manager accepts any call.

use crate::error::DeviceError;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

/// Default location of the kernel's mount table.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub path: String,
    pub options: Vec<String>,
}

/// Source of the list of mounted filesystems.
pub trait MountTable {
    fn list(&self) -> io::Result<Vec<MountEntry>>;
}

/// Reads a mount table in `/proc/mounts` format.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl ProcMounts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new(PROC_MOUNTS)
    }
}

impl MountTable for ProcMounts {
    fn list(&self) -> io::Result<Vec<MountEntry>> {
        Ok(parse_mounts(&fs::read_to_string(&self.path)?))
    }
}

impl MountTable for Vec<MountEntry> {
    fn list(&self) -> io::Result<Vec<MountEntry>> {
        Ok(self.clone())
    }
}

/// Decodes the octal escapes (`\040` for space, ...) used in mount tables.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses `device path fstype options dump pass` lines; malformed lines are skipped.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let _fstype = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                device: unescape(device),
                path: unescape(path),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Fails when sysfs is mounted read-only at `/sys`.
///
/// Only the first `sysfs` entry on `/sys` is considered. A missing entry is
/// accepted: the context initialization already proved the facility reachable.
pub fn check_sysfs_writable(mounts: &dyn MountTable) -> Result<(), DeviceError> {
    let entries = mounts.list().map_err(|e| {
        DeviceError::Initialization(format!("failed to read mount table: {}", e))
    })?;

    for entry in &entries {
        debug!(
            device = %entry.device,
            path = %entry.path,
            options = %entry.options.join(","),
            "Checking mount"
        );
        if entry.device == "sysfs" && entry.path == "/sys" {
            if entry.options.iter().any(|opt| opt == "ro") {
                return Err(DeviceError::Initialization(
                    "/sys mounted read-only, can not operate".to_string(),
                ));
            }
            if entry.options.iter().any(|opt| opt == "rw") {
                info!("/sys mounted read-write");
            }
            break;
        }
    }
    Ok(())
}
