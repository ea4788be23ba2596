//! Device Manager
//!
//! Lifecycle of PMEM namespaces on behalf of a volume provisioning service.
//!
//! ## Serialization
//!
//! The control facility is not safe for concurrent entry, so the manager owns
//! the context behind one `parking_lot::Mutex` and every operation holds it
//! for its whole duration, zeroing included. Reads take the same lock. A slow
//! create therefore blocks every other call until it returns.
//!
//! ## Clearing
//!
//! A created namespace has its head zeroed before the create returns, and a
//! deleted one is zeroed before it is destroyed, so stale data is never
//! reachable through a live namespace.

use crate::capacity::{self, CapacityReport};
use crate::clear::{ClearError, DeviceClearer, HeadClearer};
use crate::error::{DeviceError, Result};
use crate::mount::{self, MountTable};
use crate::ndctl::{
    CreateNamespaceOpts, NDCTL_ALIGN, Namespace, NamespaceMode, NdctlContext, NdctlError,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, info_span, trace, warn};

/// A namespace as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub volume_id: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Namespace lifecycle operations a PMEM backend provides.
///
/// Every method is synchronous and may block for as long as the hardware
/// takes. Implementations must be callable from many threads at once.
pub trait PmemDeviceManager: Send + Sync {
    /// Largest namespace that can currently be created, per mode.
    fn get_capacity(&self) -> Result<CapacityReport>;

    /// Allocates a namespace named `volume_id` of at least `size` bytes and
    /// clears its head. Refuses ids that are already active.
    fn create_device(&self, volume_id: &str, size: u64, mode: NamespaceMode) -> Result<()>;

    /// Clears (fully when `flush`) and destroys the namespace.
    fn delete_device(&self, volume_id: &str, flush: bool) -> Result<()>;

    /// Erases the namespace contents durably without destroying it.
    fn flush_device_data(&self, volume_id: &str) -> Result<()>;

    fn get_device(&self, volume_id: &str) -> Result<DeviceInfo>;

    /// All active fsdax and sector namespaces, in enumeration order.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Alignment of every creation request, in bytes
    pub align: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { align: NDCTL_ALIGN }
    }
}

/// Exclusive access to the context for the span of one operation.
struct Session<'a, C> {
    ctx: MutexGuard<'a, C>,
}

impl<C: NdctlContext> Session<'_, C> {
    /// The caller-facing view of a namespace, if it is a fsdax or sector
    /// namespace with a block device.
    fn device(&self, ns: &Namespace) -> Option<DeviceInfo> {
        ns.mode?;
        Some(DeviceInfo {
            volume_id: ns.name.clone(),
            path: self.ctx.device_path(ns)?,
            size: ns.size,
        })
    }

    /// Looks a name up among all active namespaces, whatever their mode.
    fn find(&self, volume_id: &str) -> Result<Option<Namespace>> {
        self.ctx
            .namespace_by_name(volume_id)
            .map_err(DeviceError::Enumeration)
    }

    fn require(&self, volume_id: &str) -> Result<Namespace> {
        self.find(volume_id)?
            .ok_or_else(|| DeviceError::NotFound(volume_id.to_string()))
    }

    fn require_device(&self, volume_id: &str) -> Result<DeviceInfo> {
        let ns = self.require(volume_id)?;
        self.device(&ns).ok_or_else(|| DeviceError::Unmanaged {
            volume_id: volume_id.to_string(),
            dev: ns.dev,
        })
    }
}

/// ndctl-style backend: namespaces allocated through an [`NdctlContext`].
pub struct NdctlDeviceManager<C, Z = HeadClearer> {
    ctx: Mutex<C>,
    clearer: Z,
    config: ManagerConfig,
}

impl<C: NdctlContext, Z: DeviceClearer> NdctlDeviceManager<C, Z> {
    /// Initializes the context and runs the startup guard.
    ///
    /// Fails with `DeviceError::Initialization` when the context cannot be
    /// created or `/sys` is mounted read-only. Neither is retried.
    pub fn new<F>(
        init: F,
        clearer: Z,
        mounts: &dyn MountTable,
        config: ManagerConfig,
    ) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<C, NdctlError>,
    {
        let ctx = init().map_err(|e| {
            DeviceError::Initialization(format!("failed to initialize pmem context: {}", e))
        })?;

        mount::check_sysfs_writable(mounts)?;

        info!(align = config.align, "PMEM device manager ready");
        Ok(Self {
            ctx: Mutex::new(ctx),
            clearer,
            config,
        })
    }

    fn session(&self) -> Session<'_, C> {
        let start = Instant::now();
        let ctx = self.ctx.lock();
        trace!(
            waited_us = start.elapsed().as_micros() as u64,
            "Acquired ndctl lock"
        );
        Session { ctx }
    }
}

impl<C: NdctlContext, Z: DeviceClearer> PmemDeviceManager for NdctlDeviceManager<C, Z> {
    fn get_capacity(&self) -> Result<CapacityReport> {
        let _span = info_span!("get_capacity").entered();
        let session = self.session();

        let buses = session.ctx.buses().map_err(DeviceError::Enumeration)?;
        for region in buses.iter().flat_map(|bus| bus.regions.iter()) {
            trace!(
                region = %region.dev,
                ways = region.interleave_ways,
                available = region.max_available_extent,
                aligned = capacity::region_capacity(region, self.config.align),
                "Region capacity"
            );
        }

        let max = capacity::max_aligned_extent(&buses, self.config.align);
        debug!(capacity = max, "Capacity computed");
        Ok(capacity::report(max))
    }

    fn create_device(&self, volume_id: &str, size: u64, mode: NamespaceMode) -> Result<()> {
        let _span = info_span!("create_device", volume_id = %volume_id, size, mode = %mode).entered();
        let mut session = self.session();

        // also catches retries after CreatedUncleared
        if session.find(volume_id)?.is_some() {
            debug!("Namespace with this name exists, refusing to create another");
            return Err(DeviceError::AlreadyExists(volume_id.to_string()));
        }

        // The library keeps its metadata inside the namespace and rounds up
        // to the alignment, so the usable size ends one step short.
        let request = size.checked_add(self.config.align).ok_or_else(|| {
            DeviceError::InvalidArgument(format!("size {} too large to align", size))
        })?;
        debug!(request, "Requesting one extra alignment step for metadata");

        let ns = session
            .ctx
            .create_namespace(CreateNamespaceOpts {
                name: volume_id.to_string(),
                size: request,
                align: self.config.align,
                mode,
            })
            .inspect_err(|e| warn!(error = %e, request, "Namespace allocation failed"))
            .map_err(|source| DeviceError::Allocation {
                volume_id: volume_id.to_string(),
                source,
            })?;
        info!(dev = %ns.dev, blockdev = ?ns.blockdev, size = ns.size, "Namespace created");

        let Some(device) = session.device(&ns) else {
            warn!(dev = %ns.dev, "New namespace has no block device, namespace left allocated");
            return Err(DeviceError::CreatedUncleared {
                volume_id: volume_id.to_string(),
                source: ClearError::NoBlockDevice(ns.dev),
            });
        };
        if let Err(source) = self.clearer.clear(&device, false) {
            warn!(error = %source, path = %device.path.display(), "Clearing new namespace failed, namespace left allocated");
            return Err(DeviceError::CreatedUncleared {
                volume_id: volume_id.to_string(),
                source,
            });
        }
        Ok(())
    }

    fn delete_device(&self, volume_id: &str, flush: bool) -> Result<()> {
        let _span = info_span!("delete_device", volume_id = %volume_id, flush).entered();
        let mut session = self.session();

        let ns = session.require(volume_id)?;
        match session.device(&ns) {
            Some(device) => self
                .clearer
                .clear(&device, flush)
                .inspect_err(|e| warn!(error = %e, "Clearing failed, namespace kept"))
                .map_err(|source| DeviceError::Zeroize {
                    volume_id: volume_id.to_string(),
                    source,
                })?,
            None => warn!(dev = %ns.dev, mode = ?ns.mode, "Namespace has no block device to clear"),
        }

        session
            .ctx
            .destroy_namespace_by_name(volume_id)
            .inspect_err(|e| warn!(error = %e, "Namespace destruction failed"))
            .map_err(|source| DeviceError::Destroy {
                volume_id: volume_id.to_string(),
                source,
            })?;
        info!(dev = %ns.dev, "Namespace destroyed");
        Ok(())
    }

    fn flush_device_data(&self, volume_id: &str) -> Result<()> {
        let _span = info_span!("flush_device_data", volume_id = %volume_id).entered();
        let session = self.session();

        let device = session.require_device(volume_id)?;
        self.clearer
            .clear(&device, true)
            .inspect_err(|e| warn!(error = %e, "Flushing device failed"))
            .map_err(|source| DeviceError::Zeroize {
                volume_id: volume_id.to_string(),
                source,
            })
    }

    fn get_device(&self, volume_id: &str) -> Result<DeviceInfo> {
        let _span = info_span!("get_device", volume_id = %volume_id).entered();
        self.session().require_device(volume_id)
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let _span = info_span!("list_devices").entered();
        let session = self.session();

        let namespaces = session
            .ctx
            .active_namespaces()
            .map_err(DeviceError::Enumeration)?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| session.device(ns))
            .collect())
    }
}
