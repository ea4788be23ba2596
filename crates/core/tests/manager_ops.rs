//! End-to-end device lifecycle against the emulated backend and a scripted ndctl

use pmd_core::{
    DeviceError, EmulatedContext, ErrorKind, HeadClearer, ManagerConfig, MountEntry,
    NamespaceMode, NdctlDeviceManager, PmemDeviceManager, RegionSpec,
};
use std::fs;
use std::path::Path;

const MIB: u64 = 1024 * 1024;

fn open(root: &Path, regions: Vec<RegionSpec>) -> NdctlDeviceManager<EmulatedContext> {
    let root = root.to_path_buf();
    NdctlDeviceManager::new(
        || EmulatedContext::open(root, regions),
        HeadClearer::new(),
        &Vec::<MountEntry>::new(),
        ManagerConfig { align: MIB },
    )
    .unwrap()
}

#[test]
fn test_full_lifecycle() -> Result<(), DeviceError> {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), vec![RegionSpec::new(32 * MIB, 2)]);

    let before = manager.get_capacity()?;
    assert_eq!(before[&NamespaceMode::Fsdax], 32 * MIB);

    manager.create_device("pvc-a", 3 * MIB, NamespaceMode::Fsdax)?;
    manager.create_device("pvc-b", 5 * MIB + 1, NamespaceMode::Sector)?;

    let a = manager.get_device("pvc-a")?;
    let b = manager.get_device("pvc-b")?;
    assert!(a.size >= 3 * MIB);
    assert!(b.size >= 5 * MIB + 1);
    assert_ne!(a.path, b.path);

    for device in [&a, &b] {
        let bytes = fs::read(&device.path).unwrap();
        assert!(bytes[..4096].iter().all(|&byte| byte == 0));
    }

    // 3 MiB + 1 MiB metadata = 4 MiB; 5 MiB + 1 + 1 MiB rounds up to 8 MiB
    let after = manager.get_capacity()?;
    assert_eq!(after[&NamespaceMode::Sector], 20 * MIB);
    assert_eq!(after[&NamespaceMode::Fsdax], after[&NamespaceMode::Sector]);

    let ids: Vec<_> = manager
        .list_devices()?
        .into_iter()
        .map(|d| d.volume_id)
        .collect();
    assert_eq!(ids, vec!["pvc-a", "pvc-b"]);

    manager.delete_device("pvc-a", true)?;
    assert!(
        manager
            .list_devices()?
            .iter()
            .all(|d| d.volume_id != "pvc-a")
    );
    manager.delete_device("pvc-b", false)?;
    assert!(manager.list_devices()?.is_empty());
    assert_eq!(manager.get_capacity()?, before);
    Ok(())
}

#[test]
fn test_devices_survive_restart() -> Result<(), DeviceError> {
    let dir = tempfile::tempdir().unwrap();
    let regions = vec![RegionSpec::new(16 * MIB, 1)];

    {
        let manager = open(dir.path(), regions.clone());
        manager.create_device("pvc-1", 2 * MIB, NamespaceMode::Fsdax)?;
        let device = manager.get_device("pvc-1")?;
        fs::write(&device.path, b"filesystem superblock").unwrap();
    }

    let manager = open(dir.path(), regions);
    let device = manager.get_device("pvc-1")?;
    assert!(fs::read(&device.path).unwrap().starts_with(b"filesystem"));

    let err = manager
        .create_device("pvc-1", 2 * MIB, NamespaceMode::Fsdax)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    manager.flush_device_data("pvc-1")?;
    assert!(fs::read(&device.path).unwrap().iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn test_full_region_reports_allocation_failure() -> Result<(), DeviceError> {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), vec![RegionSpec::new(8 * MIB, 1)]);

    manager.create_device("pvc-1", 6 * MIB, NamespaceMode::Fsdax)?;
    assert_eq!(manager.get_capacity()?[&NamespaceMode::Fsdax], MIB);

    let err = manager
        .create_device("pvc-2", MIB, NamespaceMode::Fsdax)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    assert!(err.to_string().contains("pvc-2"));
    assert_eq!(manager.list_devices()?.len(), 1);
    Ok(())
}

#[test]
fn test_read_only_sysfs_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mounts = pmd_core::mount::parse_mounts(
        "proc /proc proc rw 0 0\nsysfs /sys sysfs ro,nosuid,nodev,noexec 0 0\n",
    );

    let result = NdctlDeviceManager::new(
        || EmulatedContext::open(root, vec![RegionSpec::new(8 * MIB, 1)]),
        HeadClearer::new(),
        &mounts,
        ManagerConfig::default(),
    );
    match result {
        Err(DeviceError::Initialization(msg)) => assert!(msg.contains("read-only")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("manager started on read-only sysfs"),
    }
}

#[cfg(unix)]
#[test]
fn test_capacity_through_ndctl_binary() -> Result<(), DeviceError> {
    use pmd_core::CliContext;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ndctl");
    fs::write(
        &script,
        "#!/bin/sh\n\
         case \"$1\" in\n\
           version) echo 78 ;;\n\
           list) echo '[{\"dev\":\"ndbus0\",\"regions\":[{\"dev\":\"region0\",\"type\":\"pmem\",\"max_available_extent\":11811160064,\"mappings\":[{\"dimm\":\"nmem0\"},{\"dimm\":\"nmem1\"}]}]}]' ;;\n\
           *) exit 1 ;;\n\
         esac\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let manager = NdctlDeviceManager::new(
        || CliContext::new(&script),
        HeadClearer::new(),
        &Vec::<MountEntry>::new(),
        ManagerConfig::default(),
    )?;

    // 11 GiB over two interleave ways floors to 10 GiB
    let capacity = manager.get_capacity()?;
    assert_eq!(capacity[&NamespaceMode::Fsdax], 10 << 30);
    assert_eq!(capacity[&NamespaceMode::Sector], 10 << 30);
    Ok(())
}

/// Clearer that only records what it was asked to clear
#[cfg(unix)]
#[derive(Clone, Default)]
struct RecordingClearer(std::sync::Arc<parking_lot::Mutex<Vec<(std::path::PathBuf, bool)>>>);

#[cfg(unix)]
impl pmd_core::DeviceClearer for RecordingClearer {
    fn clear(
        &self,
        device: &pmd_core::DeviceInfo,
        flush: bool,
    ) -> Result<(), pmd_core::ClearError> {
        self.0.lock().push((device.path.clone(), flush));
        Ok(())
    }
}

/// ndctl stand-in: `list` prints `listing`, mutating commands are appended to
/// `calls.log` and `create-namespace` prints the namespace matching its mode.
#[cfg(unix)]
fn scripted_manager(
    dir: &Path,
    listing: &str,
) -> (
    NdctlDeviceManager<pmd_core::CliContext, RecordingClearer>,
    RecordingClearer,
    std::path::PathBuf,
) {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("calls.log");
    let script = dir.join("ndctl");
    let body = format!(
        "#!/bin/sh\n\
         case \"$1\" in\n\
           version) echo 78 ;;\n\
           list) echo '{listing}' ;;\n\
           create-namespace)\n\
             echo \"$*\" >> '{log}'\n\
             case \"$*\" in\n\
               *sector*) echo '{{\"dev\":\"namespace0.1\",\"mode\":\"sector\",\"size\":1071644672,\"sector_size\":4096,\"blockdev\":\"pmem0.1s\",\"name\":\"vol-s\"}}' ;;\n\
               *) echo '{{\"dev\":\"namespace0.0\",\"mode\":\"fsdax\",\"map\":\"dev\",\"size\":1054867456,\"blockdev\":\"pmem0\",\"name\":\"vol-f\"}}' ;;\n\
             esac ;;\n\
           destroy-namespace) echo \"$*\" >> '{log}' ;;\n\
           *) exit 1 ;;\n\
         esac\n",
        log = log.display(),
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let clearer = RecordingClearer::default();
    let manager = NdctlDeviceManager::new(
        || pmd_core::CliContext::new(&script),
        clearer.clone(),
        &Vec::<MountEntry>::new(),
        ManagerConfig::default(),
    )
    .unwrap();
    (manager, clearer, log)
}

#[cfg(unix)]
const DEVDAX_PVC_1: &str =
    r#"[{"dev":"namespace0.3","mode":"devdax","size":4096,"chardev":"dax0.3","name":"pvc-1"},{"dev":"namespace0.4","mode":"raw","size":4096,"name":"pvc-2"}]"#;

#[cfg(unix)]
#[test]
fn test_unmanaged_ndctl_namespace_blocks_create() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, clearer, log) = scripted_manager(dir.path(), DEVDAX_PVC_1);

    for id in ["pvc-1", "pvc-2"] {
        let err = manager
            .create_device(id, 1 << 30, NamespaceMode::Fsdax)
            .unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyExists(ref name) if name == id));
    }
    assert!(!log.exists(), "create-namespace must not run");
    assert!(manager.list_devices().unwrap().is_empty());
    assert_eq!(
        manager.get_device("pvc-1").unwrap_err().kind(),
        ErrorKind::Unmanaged
    );
    assert!(clearer.0.lock().is_empty());
}

#[cfg(unix)]
#[test]
fn test_unmanaged_ndctl_namespace_can_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, clearer, log) = scripted_manager(dir.path(), DEVDAX_PVC_1);

    manager.delete_device("pvc-1", true).unwrap();
    assert_eq!(
        fs::read_to_string(&log).unwrap().trim(),
        "destroy-namespace --force namespace0.3"
    );
    assert!(clearer.0.lock().is_empty());
}

#[cfg(unix)]
#[test]
fn test_ndctl_create_clears_new_block_device() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, clearer, log) = scripted_manager(dir.path(), "[]");

    manager
        .create_device("vol-f", 1 << 30, NamespaceMode::Fsdax)
        .unwrap();
    manager
        .create_device("vol-s", 1 << 30, NamespaceMode::Sector)
        .unwrap();

    assert_eq!(
        *clearer.0.lock(),
        vec![
            (std::path::PathBuf::from("/dev/pmem0"), false),
            (std::path::PathBuf::from("/dev/pmem0.1s"), false),
        ]
    );
    let calls = fs::read_to_string(&log).unwrap();
    let calls: Vec<_> = calls.lines().collect();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("create-namespace --name vol-f"));
    assert!(calls[0].ends_with("--mode fsdax"));
    assert!(calls[1].ends_with("--mode sector"));
}
