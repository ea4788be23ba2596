//! pmd-core: serialized lifecycle management of persistent-memory namespaces
//!
//! A [`manager::NdctlDeviceManager`] sits between a volume provisioning
//! service and the namespace control facility. It hands out namespaces by
//! volume id, reports how much can still be allocated, and clears device
//! contents on the way in and out. Every call is serialized behind one lock.
//!
//! Backends implement [`ndctl::NdctlContext`]:
//! - [`ndctl::CliContext`] drives the system `ndctl` tool
//! - [`ndctl::EmulatedContext`] keeps namespaces as image files in a directory

pub mod capacity;
pub mod clear;
pub mod error;
pub mod manager;
pub mod mount;
pub mod ndctl;

pub use capacity::CapacityReport;
pub use clear::{ClearError, DeviceClearer, HeadClearer};
pub use error::{DeviceError, ErrorKind, Result};
pub use manager::{DeviceInfo, ManagerConfig, NdctlDeviceManager, PmemDeviceManager};
pub use mount::{MountEntry, MountTable, ProcMounts};
pub use ndctl::{CliContext, EmulatedContext, NamespaceMode, NdctlContext, NdctlError, RegionSpec};
