//! Device Zeroizer
//!
//! Namespaces are carved out of media that previous tenants wrote to. Before a
//! device is handed out, and before it is given back, its leading bytes are
//! overwritten so no stale filesystem signature can be recognized.
//!
//! - `flush == false`: zero the first 4 KiB (configurable)
//! - `flush == true`: zero the whole device and `sync_all` before returning

use crate::manager::DeviceInfo;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Bytes cleared at the start of a device when no flush is requested.
pub const DEFAULT_CLEAR_BYTES: u64 = 4 * 1024;

const ERASE_CHUNK: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ClearError {
    #[error("device {0} does not exist")]
    Missing(PathBuf),
    #[error("{0} is neither a block device nor a regular file")]
    NotADevice(PathBuf),
    #[error("namespace {0} has no block device")]
    NoBlockDevice(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Overwrites the leading bytes of a device.
///
/// Called with the manager lock held, on devices that were just created or are
/// about to be destroyed.
pub trait DeviceClearer: Send + Sync {
    fn clear(&self, device: &DeviceInfo, flush: bool) -> Result<(), ClearError>;
}

/// Zeroizer writing through the device node.
#[derive(Debug, Clone)]
pub struct HeadClearer {
    head_bytes: u64,
}

impl HeadClearer {
    pub fn new() -> Self {
        Self::with_head_bytes(DEFAULT_CLEAR_BYTES)
    }

    pub fn with_head_bytes(head_bytes: u64) -> Self {
        Self { head_bytes }
    }
}

impl Default for HeadClearer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn is_block_device(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_file_type: &fs::FileType) -> bool {
    false
}

impl DeviceClearer for HeadClearer {
    fn clear(&self, device: &DeviceInfo, flush: bool) -> Result<(), ClearError> {
        let path = &device.path;
        let io_err = |source: io::Error| ClearError::Io {
            path: path.clone(),
            source,
        };

        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClearError::Missing(path.clone()));
            }
            Err(e) => return Err(io_err(e)),
        };

        let file_type = metadata.file_type();
        // block devices report a zero length through stat
        let device_len = if file_type.is_file() {
            metadata.len()
        } else if is_block_device(&file_type) {
            device.size
        } else {
            return Err(ClearError::NotADevice(path.clone()));
        };

        let len = if flush {
            device_len
        } else {
            self.head_bytes.min(device_len)
        };

        let mut file = OpenOptions::new().write(true).open(path).map_err(io_err)?;
        let zeros = vec![0u8; ERASE_CHUNK.min(len as usize).max(1)];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n]).map_err(io_err)?;
            remaining -= n as u64;
        }

        if flush {
            file.sync_all().map_err(io_err)?;
            info!(device = %path.display(), bytes = len, "Device erased and flushed");
        } else {
            debug!(device = %path.display(), bytes = len, "Device head cleared");
        }
        Ok(())
    }
}
