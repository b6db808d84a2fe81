//! Persistence tests: dump a VM, release it and pick it up again with a
//! fresh driver, as a restarted daemon would.

mod common;

use common::{
    block_container, block_volume, boot, container, dir_volume, interface, test_config,
    MockAgent, MockDriver, WAIT,
};
use paddock_core::{
    ContainerState, CoreError, Vm, VmState, COMPATIBLE_PERSIST_VERSION, CURRENT_PERSIST_VERSION,
};
use paddock_vm::VmError;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn associate(driver: &MockDriver, id: &str, data: &[u8]) -> paddock_core::Result<Vm> {
    Vm::associate(
        id,
        driver,
        Arc::new(MockAgent::default()),
        test_config(),
        data,
    )
}

fn rewrite(data: &[u8], edit: impl FnOnce(&mut Value)) -> Vec<u8> {
    let mut value: Value = serde_json::from_slice(data).expect("snapshot is JSON");
    edit(&mut value);
    serde_json::to_vec(&value).expect("Failed to encode")
}

/// Everything a released VM had is there after reassociation.
#[tokio::test]
async fn test_release_then_associate_round_trip() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    vm.add_volume(dir_volume("data")).await.expect("Failed to add volume");
    vm.add_volume(block_volume("disk0")).await.expect("Failed to add volume");
    let added = vm
        .add_container(block_container("c1", &["data"]))
        .await
        .expect("Failed to add container");
    assert!(added.success);
    let plugged = vm
        .add_interface(interface("net0", "10.0.0.2/24", "10.0.0.1"))
        .await
        .expect("Failed to add interface");
    assert!(plugged.success);
    let hw = vm.context().hardware();

    let data = vm.release().await.expect("Failed to release");
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("released VM should reach None");

    let restarted = MockDriver::new();
    let vm = associate(&restarted, "vm-test", &data).expect("Failed to associate");
    let ctx = vm.context();

    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(restarted.script.loads.load(Ordering::SeqCst), 1);
    assert_eq!(restarted.count("associate"), 1);
    assert_eq!(restarted.count("launch"), 0);
    assert_eq!(ctx.volume_names(), vec!["data", "disk0"]);
    assert_eq!(ctx.volume_observers("data"), Some(vec!["c1".to_string()]));
    assert_eq!(ctx.containers(), vec![("c1".to_string(), ContainerState::Ready)]);
    assert_eq!(ctx.container_root("c1").as_deref(), Some("c1-root"));
    assert_eq!(ctx.hardware(), hw);
    let net = ctx.interface("net0").expect("interface restored");
    assert_eq!(net.device_name, "eth0");
    assert_eq!(net.ip_addr, "10.0.0.2/24");

    // numbering continues where the old daemon left off
    vm.add_volume(block_volume("disk1")).await.expect("Failed to add volume");
    let info = ctx.dump().expect("Failed to dump");
    let disk1 = info
        .volume_list
        .iter()
        .find(|v| v.name == "disk1")
        .expect("disk1 dumped");
    assert_eq!(disk1.scsi_id, Some(hw.scsi_id));

    // a restored volume keeps its observers
    let err = vm.remove_volume("data").await.expect_err("data is in use");
    assert!(matches!(err, CoreError::Busy(_)));
}

/// Snapshots from a newer or too old version are refused before the driver
/// sees them.
#[tokio::test]
async fn test_unsupported_versions_rejected() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let data = vm.dump().expect("Failed to dump");

    for version in [CURRENT_PERSIST_VERSION + 1, COMPATIBLE_PERSIST_VERSION - 1] {
        let data = rewrite(&data, |v| v["persist_version"] = json!(version));
        let restarted = MockDriver::new();
        let err = associate(&restarted, "vm-test", &data).expect_err("version must be refused");
        assert!(
            matches!(err, CoreError::Version { found, .. } if found == version),
            "got {err:?}"
        );
        assert_eq!(restarted.script.loads.load(Ordering::SeqCst), 0);
        assert!(restarted.calls().is_empty());
    }
}

/// A snapshot of another VM is refused.
#[tokio::test]
async fn test_id_mismatch_rejected() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let data = vm.dump().expect("Failed to dump");

    let restarted = MockDriver::new();
    let err = associate(&restarted, "vm-other", &data).expect_err("wrong vm");
    match err {
        CoreError::IdMismatch { expected, found } => {
            assert_eq!(expected, "vm-other");
            assert_eq!(found, "vm-test");
        }
        other => panic!("expected id mismatch, got {other:?}"),
    }
    assert_eq!(restarted.script.loads.load(Ordering::SeqCst), 0);
}

/// Driver state from another backend is refused by the driver.
#[tokio::test]
async fn test_foreign_driver_state_rejected() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let data = rewrite(&vm.dump().expect("Failed to dump"), |v| {
        v["driver_info"] = json!({ "hypervisor": "qemu" })
    });

    let err = associate(&MockDriver::new(), "vm-test", &data).expect_err("foreign state");
    assert!(matches!(err, CoreError::Vm(VmError::Driver(_))), "got {err:?}");
}

/// The older format marks a root volume by its `/` mount point.
#[tokio::test]
async fn test_legacy_snapshot_associates() {
    let desc = block_container("c1", &["data"]);
    let data = serde_json::to_vec(&json!({
        "persist_version": COMPATIBLE_PERSIST_VERSION,
        "id": "vm-old",
        "driver_info": { "hypervisor": "mock" },
        "hw_stat": { "pci_addr": 5, "scsi_id": 1, "attach_id": 7 },
        "volume_list": [
            {
                "name": "c1-root",
                "source": "/dev/mapper/c1-root",
                "format": "raw",
                "fstype": "ext4",
                "device_name": "sda",
                "scsi_id": 0,
                "scsi_addr": "0:0",
                "containers": ["c1"],
                "mount_points": ["/"]
            },
            {
                "name": "data",
                "source": "/srv/data",
                "format": "vfs",
                "fstype": "dir",
                "containers": ["c1"],
                "mount_points": ["/mnt/data"]
            }
        ],
        "container_list": [desc],
    }))
    .expect("Failed to encode");

    common::init_tracing();
    let vm = associate(&MockDriver::new(), "vm-old", &data).expect("Failed to associate");
    let ctx = vm.context();

    assert_eq!(ctx.volume_names(), vec!["data"]);
    assert_eq!(ctx.container_root("c1").as_deref(), Some("c1-root"));
    assert_eq!(ctx.volume_observers("data"), Some(vec!["c1".to_string()]));
    assert_eq!(ctx.containers(), vec![("c1".to_string(), ContainerState::Ready)]);
    assert_eq!(ctx.next_attach_id(), 7);

    // re-dumped in the current format
    let info = ctx.dump().expect("Failed to dump");
    assert_eq!(info.persist_version, CURRENT_PERSIST_VERSION);
    let root = info
        .volume_list
        .iter()
        .find(|v| v.name == "c1-root")
        .expect("root dumped");
    assert!(root.is_root);
    assert!(root.mount_points.is_empty());
}

/// Legacy entries whose container and mount point lists disagree are
/// corrupt.
#[tokio::test]
async fn test_legacy_snapshot_with_mismatched_mounts_is_corrupt() {
    let data = serde_json::to_vec(&json!({
        "persist_version": COMPATIBLE_PERSIST_VERSION,
        "id": "vm-old",
        "driver_info": { "hypervisor": "mock" },
        "hw_stat": { "pci_addr": 5, "scsi_id": 0, "attach_id": 1 },
        "volume_list": [{
            "name": "data",
            "source": "/srv/data",
            "format": "vfs",
            "fstype": "dir",
            "containers": ["c1", "c2"],
            "mount_points": ["/mnt/data"]
        }],
        "container_list": [container("c1", &["data"])],
    }))
    .expect("Failed to encode");

    let driver = MockDriver::new();
    let err = associate(&driver, "vm-old", &data).expect_err("mismatched lists");
    assert!(matches!(err, CoreError::Corrupt(_)), "got {err:?}");
    assert_eq!(driver.script.loads.load(Ordering::SeqCst), 0);
}

/// Attaches still in flight when the snapshot was taken are issued again
/// and the waiting container becomes ready.
#[tokio::test]
async fn test_pending_attaches_resume_after_associate() {
    let driver = MockDriver::holding();
    let (vm, _agent) = boot(&driver).await;
    let ctx = vm.context();

    let (tx, _volume_rx) = paddock_core::result_channel();
    ctx.add_volume(block_volume("disk0"), tx)
        .expect("Failed to add volume");
    let (tx, _container_rx) = paddock_core::result_channel();
    ctx.add_container(block_container("c1", &["disk0"]), tx)
        .expect("Failed to add container");
    let data = vm.dump().expect("Failed to dump");
    vm.release().await.expect("Failed to release");

    let restarted = MockDriver::new();
    let vm = associate(&restarted, "vm-test", &data).expect("Failed to associate");

    vm.wait_container_ready("c1", WAIT)
        .await
        .expect("container should become ready");
    assert_eq!(restarted.count("add_disk"), 2);
    assert_eq!(vm.context().volume_ready("disk0"), Some(true));
    assert_eq!(vm.context().hardware().scsi_id, 2);
}
