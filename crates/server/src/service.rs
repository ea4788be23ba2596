//! Async adapter over a [`PmemDeviceManager`]
//!
//! Manager calls block, sometimes for as long as a full device erase. Each one
//! runs on the tokio blocking pool so async callers are never stalled, and an
//! optional timeout bounds how long the caller waits. A timed out call is not
//! cancelled: it keeps the manager lock until it finishes in the background.

use crate::config::{Backend, Config};
use pmd_core::{
    CapacityReport, CliContext, DeviceError, DeviceInfo, EmulatedContext, HeadClearer,
    ManagerConfig, MountEntry, NamespaceMode, NdctlDeviceManager, PmemDeviceManager, ProcMounts,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{Span, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{op} did not complete within {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("{op} task failed: {source}")]
    Join {
        op: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Builds the manager described by `config`, running the startup guard.
pub fn open_manager(config: &Config) -> Result<Arc<dyn PmemDeviceManager>, DeviceError> {
    let clearer = HeadClearer::with_head_bytes(config.clear_bytes);
    let manager_config = ManagerConfig {
        align: config.align,
    };

    match config.backend {
        Backend::Ndctl => {
            let binary = config.ndctl_binary.clone();
            let manager = NdctlDeviceManager::new(
                || CliContext::new(binary),
                clearer,
                &ProcMounts::new(&config.mounts),
                manager_config,
            )?;
            Ok(Arc::new(manager))
        }
        Backend::Emulated => {
            let root = config.emulated_root.clone();
            let regions = config.emulated_regions.clone();
            // the emulation never writes through sysfs
            let manager = NdctlDeviceManager::new(
                || EmulatedContext::open(root, regions),
                clearer,
                &Vec::<MountEntry>::new(),
                manager_config,
            )?;
            Ok(Arc::new(manager))
        }
    }
}

#[derive(Clone)]
pub struct DeviceService {
    manager: Arc<dyn PmemDeviceManager>,
    timeout: Option<Duration>,
}

impl DeviceService {
    pub fn new(manager: Arc<dyn PmemDeviceManager>, timeout: Option<Duration>) -> Self {
        Self { manager, timeout }
    }

    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let manager = open_manager(config)?;
        info!(backend = ?config.backend, align = config.align, "Device service ready");
        Ok(Self::new(manager, config.timeout()))
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PmemDeviceManager) -> pmd_core::Result<T> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        let span = Span::current();
        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            f(manager.as_ref())
        });

        let joined = match self.timeout {
            Some(after) => match tokio::time::timeout(after, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(op, timeout_ms = after.as_millis() as u64, "Operation timed out, still running in background");
                    return Err(ServiceError::Timeout { op, after });
                }
            },
            None => task.await,
        };

        let result = joined.map_err(|source| ServiceError::Join { op, source })?;
        Ok(result?)
    }

    pub async fn get_capacity(&self) -> Result<CapacityReport, ServiceError> {
        self.call("get_capacity", |m| m.get_capacity()).await
    }

    pub async fn create_device(
        &self,
        volume_id: &str,
        size: u64,
        mode: NamespaceMode,
    ) -> Result<(), ServiceError> {
        let volume_id = volume_id.to_string();
        self.call("create_device", move |m| m.create_device(&volume_id, size, mode))
            .await
    }

    pub async fn delete_device(&self, volume_id: &str, flush: bool) -> Result<(), ServiceError> {
        let volume_id = volume_id.to_string();
        self.call("delete_device", move |m| m.delete_device(&volume_id, flush))
            .await
    }

    pub async fn flush_device_data(&self, volume_id: &str) -> Result<(), ServiceError> {
        let volume_id = volume_id.to_string();
        self.call("flush_device_data", move |m| m.flush_device_data(&volume_id))
            .await
    }

    pub async fn get_device(&self, volume_id: &str) -> Result<DeviceInfo, ServiceError> {
        let volume_id = volume_id.to_string();
        self.call("get_device", move |m| m.get_device(&volume_id))
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        self.call("list_devices", |m| m.list_devices()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmd_core::{ErrorKind, RegionSpec};

    const MIB: u64 = 1024 * 1024;

    fn emulated_config(root: &std::path::Path) -> Config {
        Config {
            backend: Backend::Emulated,
            emulated_root: root.to_path_buf(),
            emulated_regions: vec![RegionSpec::new(32 * MIB, 1)],
            align: MIB,
            ..Config::default()
        }
    }

    /// Answers every call after a fixed delay; panics on flush.
    struct Sluggish(Duration);

    impl PmemDeviceManager for Sluggish {
        fn get_capacity(&self) -> pmd_core::Result<CapacityReport> {
            std::thread::sleep(self.0);
            Ok(CapacityReport::new())
        }
        fn create_device(&self, _: &str, _: u64, _: NamespaceMode) -> pmd_core::Result<()> {
            std::thread::sleep(self.0);
            Ok(())
        }
        fn delete_device(&self, id: &str, _: bool) -> pmd_core::Result<()> {
            Err(DeviceError::NotFound(id.to_string()))
        }
        fn flush_device_data(&self, _: &str) -> pmd_core::Result<()> {
            panic!("flush exploded");
        }
        fn get_device(&self, id: &str) -> pmd_core::Result<DeviceInfo> {
            Err(DeviceError::NotFound(id.to_string()))
        }
        fn list_devices(&self) -> pmd_core::Result<Vec<DeviceInfo>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = DeviceService::from_config(&emulated_config(dir.path())).unwrap();

        let capacity = service.get_capacity().await.unwrap();
        assert_eq!(capacity[&NamespaceMode::Fsdax], 32 * MIB);

        service
            .create_device("pvc-1", 4 * MIB, NamespaceMode::Sector)
            .await
            .unwrap();
        let device = service.get_device("pvc-1").await.unwrap();
        assert!(device.size >= 4 * MIB);
        assert_eq!(service.list_devices().await.unwrap(), vec![device]);

        let err = service
            .create_device("pvc-1", MIB, NamespaceMode::Sector)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Device(ref e) if e.kind() == ErrorKind::AlreadyExists));

        service.flush_device_data("pvc-1").await.unwrap();
        service.delete_device("pvc-1", true).await.unwrap();
        assert!(service.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        let service = DeviceService::from_config(&emulated_config(dir.path())).unwrap();

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .create_device(&format!("pvc-{}", i), MIB, NamespaceMode::Fsdax)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(service.list_devices().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_timeout() {
        let service = DeviceService::new(
            Arc::new(Sluggish(Duration::from_millis(300))),
            Some(Duration::from_millis(20)),
        );
        let err = service.get_capacity().await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { op: "get_capacity", .. }));

        // fast calls still complete under the limit
        assert!(service.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_call_is_reported() {
        let service = DeviceService::new(Arc::new(Sluggish(Duration::ZERO)), None);
        let err = service.flush_device_data("pvc-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Join { op: "flush_device_data", .. }));

        let err = service.get_device("pvc-1").await.unwrap_err();
        assert_eq!(err.to_string(), "namespace pvc-1 not found");
    }

    #[test]
    fn test_missing_ndctl_fails_initialization() {
        let config = Config {
            ndctl_binary: "/nonexistent/ndctl".into(),
            ..Config::default()
        };
        let err = open_manager(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InitializationFailure);
    }
}
