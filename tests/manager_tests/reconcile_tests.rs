//! Tests for the reconciliation loop
//!
//! These tests verify:
//! - New devices are attached to free mount points
//! - Invalid volumes are drained, unmounted and their slots freed
//! - The status snapshot mirrors the active volumes
//! - The background thread runs passes and stops cleanly

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use usbdb::config::Config;
use usbdb::control::MemoryVolumeControl;
use usbdb::manager::{Manager, ReconcileReport};
use usbdb::status::KvFile;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp: &Path) -> Config {
    Config::builder()
        .root_dir(temp.join("store"))
        .info_dir(temp.join("info"))
        .scripts_dir(temp.join("scripts"))
        .max_volumes(2)
        .max_writers(2)
        .write_rate_ms(0)
        .compaction_delay_ms(0)
        .reconcile_interval_ms(20)
        .drain_poll_ms(10)
        .use_sudo(false)
        .build()
}

fn setup(devices: &[&str]) -> (TempDir, Arc<MemoryVolumeControl>, Arc<Manager>) {
    let temp_dir = TempDir::new().unwrap();
    let control = Arc::new(MemoryVolumeControl::new());
    for device in devices {
        control.attach(device, 75);
    }

    let manager = Arc::new(Manager::with_status_file(
        test_config(temp_dir.path()),
        control.clone(),
    ));
    manager.init().unwrap();
    (temp_dir, control, manager)
}

fn store_root(temp: &TempDir) -> PathBuf {
    fs::canonicalize(temp.path().join("store")).unwrap()
}

fn read_status(temp: &TempDir) -> KvFile {
    let mut status = KvFile::open(temp.path().join("info").join("usb_drives.info"));
    status.load().unwrap();
    status
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn assert_slots_accounted(manager: &Manager) {
    assert_eq!(
        manager.active_volume_count() + manager.free_mount_points().len(),
        manager.config().max_volumes
    );
}

// =============================================================================
// Attach Tests
// =============================================================================

#[test]
fn test_pass_attaches_new_device() {
    let (temp, control, manager) = setup(&[]);
    assert_eq!(manager.active_volume_count(), 0);

    control.attach("/dev/sdb1", 75);
    let report = manager.reconcile_once().unwrap();

    assert_eq!(
        report,
        ReconcileReport {
            removed: 0,
            attached: 1,
            active: 1,
            status_saved: true,
        }
    );
    assert_eq!(
        control.mounted_on("/dev/sdb1"),
        Some(store_root(&temp).join("db1"))
    );
    assert_slots_accounted(&manager);
}

#[test]
fn test_pass_ignores_known_devices() {
    let (_temp, control, manager) = setup(&["/dev/sdb1"]);

    let report = manager.reconcile_once().unwrap();

    assert_eq!(report.attached, 0);
    assert_eq!(report.active, 1);
    assert_eq!(control.mount_calls().len(), 1);
}

#[test]
fn test_pass_without_free_slots() {
    let (_temp, control, manager) = setup(&["/dev/sdb1", "/dev/sdc1"]);
    control.attach("/dev/sdd1", 75);

    let report = manager.reconcile_once().unwrap();

    assert_eq!(report.attached, 0);
    assert_eq!(control.mounted_on("/dev/sdd1"), None);
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[test]
fn test_detached_device_is_torn_down() {
    let (temp, control, manager) = setup(&["/dev/sdb1", "/dev/sdc1"]);
    let root = store_root(&temp);

    control.detach("/dev/sdb1");
    let report = manager.reconcile_once().unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.attached, 0);
    assert_eq!(report.active, 1);
    assert_eq!(manager.usb_drive_names(), vec!["/dev/sdc1".to_string()]);
    assert_eq!(manager.free_mount_points(), vec![root.join("db1")]);
    assert_eq!(control.unmount_calls(), vec!["/dev/sdb1".to_string()]);
    assert_slots_accounted(&manager);
}

#[test]
fn test_unmounted_device_is_torn_down_and_remounted() {
    let (temp, control, manager) = setup(&["/dev/sdb1"]);
    let root = store_root(&temp);

    control.force_unmount("/dev/sdb1");
    let report = manager.reconcile_once().unwrap();

    // Still plugged in, so the same pass mounts it again on the next free slot
    assert_eq!(report.removed, 1);
    assert_eq!(report.attached, 1);
    assert_eq!(control.mounted_on("/dev/sdb1"), Some(root.join("db2")));
    assert_eq!(manager.free_mount_points(), vec![root.join("db1")]);
    assert_slots_accounted(&manager);
}

#[test]
fn test_full_device_is_torn_down() {
    let (_temp, control, manager) = setup(&["/dev/sdb1"]);
    control.set_free_percent("/dev/sdb1", 5);

    let report = manager.reconcile_once().unwrap();

    assert_eq!(report.removed, 1);
    assert!(control.unmount_calls().contains(&"/dev/sdb1".to_string()));
}

#[test]
fn test_teardown_drains_pending_writes() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        max_writers: 1,
        chunk_size: 1,
        write_rate_ms: 50,
        ..test_config(temp_dir.path())
    };
    let control = Arc::new(MemoryVolumeControl::new());
    control.attach("/dev/sdb1", 75);
    let manager = Manager::with_status_file(config, control.clone());
    manager.init().unwrap();

    assert!(manager.save(b"12345".to_vec(), "a", false));
    assert!(manager.save(b"67890".to_vec(), "b", false));
    control.detach("/dev/sdb1");

    let report = manager.reconcile_once().unwrap();

    assert_eq!(report.removed, 1);
    let db1 = store_root(&temp_dir).join("db1");
    assert_eq!(fs::read(db1.join("a")).unwrap(), b"12345");
    assert_eq!(fs::read(db1.join("b")).unwrap(), b"67890");
}

#[test]
fn test_removed_volume_names_are_forgotten() {
    let (_temp, control, manager) = setup(&["/dev/sdb1"]);
    assert!(manager.save(b"x".to_vec(), "a", false));
    assert!(wait_until(|| manager.is_written_to_db("a")));

    control.detach("/dev/sdb1");
    manager.reconcile_once().unwrap();

    assert!(!manager.is_written_to_db("a"));
    assert_eq!(manager.total_files(), 0);
}

// =============================================================================
// Status Tests
// =============================================================================

#[test]
fn test_status_lists_active_volumes() {
    let (temp, control, manager) = setup(&["/dev/sdb1", "/dev/sdc1"]);
    control.set_free_percent("/dev/sdc1", 42);
    assert!(manager.save(b"x".to_vec(), "a", false));
    assert!(wait_until(|| manager.is_written_to_db("a")));

    assert!(manager.reconcile_once().unwrap().status_saved);

    let root = store_root(&temp);
    let status = read_status(&temp);
    assert_eq!(status.len(), 8);
    assert_eq!(status.get("USBName_1"), Some("/dev/sdb1"));
    assert_eq!(
        status.get("USBPath_1"),
        Some(root.join("db1").display().to_string().as_str())
    );
    assert_eq!(status.get("TotalFiles_1"), Some("1"));
    assert_eq!(status.get("USBStorage_1"), Some("75"));
    assert_eq!(status.get("USBName_2"), Some("/dev/sdc1"));
    assert_eq!(status.get("TotalFiles_2"), Some("0"));
    assert_eq!(status.get("USBStorage_2"), Some("42"));
}

#[test]
fn test_status_drops_removed_volumes() {
    let (temp, control, manager) = setup(&["/dev/sdb1", "/dev/sdc1"]);
    manager.reconcile_once().unwrap();
    assert_eq!(read_status(&temp).len(), 8);

    control.detach("/dev/sdb1");
    manager.reconcile_once().unwrap();

    // Indices are renumbered from 1
    let status = read_status(&temp);
    assert_eq!(status.len(), 4);
    assert_eq!(status.get("USBName_1"), Some("/dev/sdc1"));
    assert_eq!(status.get("USBName_2"), None);
}

#[test]
fn test_status_empty_without_volumes() {
    let (temp, _control, manager) = setup(&[]);

    assert!(manager.publish_status());
    assert!(read_status(&temp).is_empty());
}

// =============================================================================
// Loop Tests
// =============================================================================

#[test]
fn test_background_loop_attaches_devices() {
    let (temp, control, manager) = setup(&[]);
    let reconciler = manager.start_reconciler().unwrap();

    control.attach("/dev/sdb1", 75);
    assert!(wait_until(|| manager.active_volume_count() == 1));
    assert!(wait_until(|| read_status(&temp).get("USBName_1") == Some("/dev/sdb1")));

    control.detach("/dev/sdb1");
    assert!(wait_until(|| manager.active_volume_count() == 0));

    reconciler.stop();
    assert_slots_accounted(&manager);
}

#[test]
fn test_stop_interrupts_long_interval() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        reconcile_interval_ms: 60_000,
        ..test_config(temp_dir.path())
    };
    let manager = Arc::new(Manager::with_status_file(
        config,
        Arc::new(MemoryVolumeControl::new()),
    ));
    manager.init().unwrap();

    let reconciler = manager.start_reconciler().unwrap();
    let started = Instant::now();
    reconciler.stop();

    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_loop_exits_after_uninit() {
    let (_temp, _control, manager) = setup(&["/dev/sdb1"]);
    let reconciler = manager.start_reconciler().unwrap();

    manager.uninit();
    // wait() only returns once the loop notices the shutdown
    reconciler.wait();

    assert_eq!(manager.reconcile_once().unwrap(), ReconcileReport::default());
}
