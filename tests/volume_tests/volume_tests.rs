//! Tests for Volume
//!
//! These tests verify:
//! - init: mount, folder-index probe, indexing of existing files
//! - Asynchronous chunked writes and dedup bookkeeping
//! - Admission control on the writer pool
//! - Write failure cleanup, including partial files
//! - Validity checks and their monotonicity
//! - Teardown draining and mount ownership

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use usbdb::config::Config;
use usbdb::control::{MemoryVolumeControl, VolumeControl};
use usbdb::volume::{Volume, VolumeState};

const DEVICE: &str = "/dev/sdb1";

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(root: &Path) -> Config {
    Config::builder()
        .root_dir(root)
        .info_dir(root)
        .scripts_dir(root.join("scripts"))
        .max_writers(2)
        .write_rate_ms(0)
        .compaction_delay_ms(0)
        .drain_poll_ms(10)
        .use_sudo(false)
        .build()
}

/// Slow writes: one byte per chunk, 50ms between chunks
fn slow_config(root: &Path, max_writers: usize) -> Config {
    Config::builder()
        .root_dir(root)
        .max_writers(max_writers)
        .chunk_size(1)
        .write_rate_ms(50)
        .drain_poll_ms(10)
        .use_sudo(false)
        .build()
}

fn setup_volume(config: Config) -> (TempDir, Arc<MemoryVolumeControl>, Volume, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        root_dir: temp_dir.path().to_path_buf(),
        ..config
    };
    let mount_path = temp_dir.path().join("db1");
    let control = Arc::new(MemoryVolumeControl::new());
    control.attach(DEVICE, 80);
    let volume = Volume::new(&mount_path, DEVICE, control.clone(), &config).unwrap();
    (temp_dir, control, volume, mount_path)
}

fn setup_initialized() -> (TempDir, Arc<MemoryVolumeControl>, Volume, PathBuf) {
    let placeholder = TempDir::new().unwrap();
    let (temp, control, volume, path) = setup_volume(test_config(placeholder.path()));
    assert!(volume.init());
    (temp, control, volume, path)
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

fn wait_written(volume: &Volume, name: &str) {
    assert!(
        wait_until(|| !volume.is_currently_writing(name)),
        "write of {} never finished",
        name
    );
}

// =============================================================================
// Init Tests
// =============================================================================

#[test]
fn test_new_volume_is_uninitialized() {
    let placeholder = TempDir::new().unwrap();
    let (_temp, _control, volume, _path) = setup_volume(test_config(placeholder.path()));

    assert_eq!(volume.state(), VolumeState::Uninitialized);
    assert!(!volume.is_valid());
    assert!(!volume.write(b"data".to_vec(), "early"));
    assert_eq!(volume.device(), DEVICE);
}

#[test]
fn test_init_mounts_and_creates_directory() {
    let (_temp, control, volume, path) = setup_initialized();

    assert!(path.is_dir());
    assert_eq!(volume.state(), VolumeState::Valid);
    assert_eq!(control.mounted_on(DEVICE), Some(path.clone()));
    assert_eq!(volume.mount_path(), path.as_path());
    assert_eq!(volume.next_folder_index(), 1);
    assert_eq!(volume.total_files(), 0);
    assert_eq!(volume.root_file_count(), 0);
    assert!(volume.is_valid());
}

#[test]
fn test_init_indexes_existing_files() {
    let placeholder = TempDir::new().unwrap();
    let (_temp, _control, volume, path) = setup_volume(test_config(placeholder.path()));

    fs::create_dir_all(path.join("files_1")).unwrap();
    fs::write(path.join("a.jpg"), b"a").unwrap();
    fs::write(path.join("b.jpg"), b"b").unwrap();
    fs::write(path.join("files_1").join("c.jpg"), b"c").unwrap();
    fs::write(path.join("files_1").join("d.jpg"), b"d").unwrap();

    assert!(volume.init());

    assert_eq!(volume.total_files(), 4);
    assert_eq!(volume.root_file_count(), 2);
    assert_eq!(volume.next_folder_index(), 2);
    assert!(volume.is_written_to_db("a.jpg"));
    assert!(volume.is_written_to_db("d.jpg"));
    assert!(!volume.is_written_to_db("e.jpg"));
}

#[test]
fn test_init_fails_when_mount_fails() {
    let placeholder = TempDir::new().unwrap();
    let (_temp, control, volume, _path) = setup_volume(test_config(placeholder.path()));
    control.fail_mounts(DEVICE);

    assert!(!volume.init());
    assert_eq!(volume.state(), VolumeState::Invalid);
    assert!(!volume.is_valid());

    // Terminal: a second init does not revive it
    assert!(!volume.init());
    assert!(control.unmount_calls().is_empty());
}

#[test]
fn test_init_fails_when_folder_index_exhausted() {
    let placeholder = TempDir::new().unwrap();
    let config = Config {
        folder_probe_limit: 2,
        ..test_config(placeholder.path())
    };
    let (_temp, control, volume, path) = setup_volume(config);
    fs::create_dir_all(path.join("files_1")).unwrap();
    fs::create_dir_all(path.join("files_2")).unwrap();

    assert!(!volume.init());
    assert_eq!(volume.state(), VolumeState::Invalid);
    // It mounted, so it must give the device back
    assert_eq!(control.unmount_calls(), vec![DEVICE.to_string()]);
    assert_eq!(control.mounted_on(DEVICE), None);
}

#[test]
fn test_init_twice_is_noop() {
    let (_temp, control, volume, _path) = setup_initialized();

    assert!(volume.init());
    assert_eq!(control.mount_calls().len(), 1);
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_write_records_name_after_success() {
    let (_temp, _control, volume, path) = setup_initialized();

    assert!(volume.write(b"hello world".to_vec(), "hello.txt"));
    wait_written(&volume, "hello.txt");

    assert!(volume.is_written_to_db("hello.txt"));
    assert_eq!(volume.root_file_count(), 1);
    assert_eq!(volume.total_files(), 1);
    assert_eq!(fs::read(path.join("hello.txt")).unwrap(), b"hello world");
}

#[test]
fn test_write_in_multiple_chunks() {
    let placeholder = TempDir::new().unwrap();
    let config = Config {
        chunk_size: 7,
        ..test_config(placeholder.path())
    };
    let (_temp, _control, volume, path) = setup_volume(config);
    assert!(volume.init());

    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    assert!(volume.write(data.clone(), "blob.bin"));
    wait_written(&volume, "blob.bin");

    assert_eq!(fs::read(path.join("blob.bin")).unwrap(), data);
}

#[test]
fn test_write_empty_payload() {
    let (_temp, _control, volume, path) = setup_initialized();

    assert!(volume.write(Vec::new(), "empty"));
    wait_written(&volume, "empty");

    assert!(volume.is_written_to_db("empty"));
    assert_eq!(fs::metadata(path.join("empty")).unwrap().len(), 0);
}

#[test]
fn test_write_marks_name_in_flight_until_done() {
    let (_temp, _control, volume, _path) = setup_volume(slow_config(Path::new("."), 1));
    assert!(volume.init());

    assert!(volume.write(b"12345".to_vec(), "slow"));
    assert!(volume.is_currently_writing("slow"));
    assert!(!volume.is_written_to_db("slow"));
    assert!(volume.is_writing());

    wait_written(&volume, "slow");
    assert!(volume.is_written_to_db("slow"));
}

#[test]
fn test_write_rejects_recorded_name() {
    let (_temp, _control, volume, path) = setup_initialized();

    assert!(volume.write(b"first".to_vec(), "same"));
    wait_written(&volume, "same");

    assert!(!volume.write(b"second".to_vec(), "same"));
    assert_eq!(fs::read(path.join("same")).unwrap(), b"first");
    assert_eq!(volume.root_file_count(), 1);
}

#[test]
fn test_write_rejects_name_in_flight() {
    let (_temp, _control, volume, _path) = setup_volume(slow_config(Path::new("."), 2));
    assert!(volume.init());

    assert!(volume.write(b"12345".to_vec(), "dup"));
    assert!(!volume.write(b"12345".to_vec(), "dup"));

    wait_written(&volume, "dup");
    assert_eq!(volume.total_files(), 1);
}

#[test]
fn test_write_rejects_invalid_names() {
    let (_temp, _control, volume, _path) = setup_initialized();

    for name in ["", ".", "..", "a/b", "../escape", "nul\0byte"] {
        assert!(!volume.write(b"x".to_vec(), name), "accepted {:?}", name);
    }
    assert!(!volume.is_writing());
}

// =============================================================================
// Admission Tests
// =============================================================================

#[test]
fn test_admission_bounded_by_writer_pool() {
    let (_temp, _control, volume, _path) = setup_volume(slow_config(Path::new("."), 1));
    assert!(volume.init());

    // One executing plus one waiting
    assert!(volume.write(b"aaaaa".to_vec(), "a"));
    assert!(volume.write(b"bbbbb".to_vec(), "b"));
    assert!(!volume.can_accept_write());
    assert!(!volume.write(b"ccccc".to_vec(), "c"));
    assert!(!volume.is_currently_writing("c"));

    wait_written(&volume, "a");
    wait_written(&volume, "b");
    assert!(wait_until(|| volume.can_accept_write()));
    assert!(volume.write(b"ccccc".to_vec(), "c"));
    wait_written(&volume, "c");

    assert_eq!(volume.total_files(), 3);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_write_is_not_recorded_and_can_retry() {
    let (_temp, _control, volume, path) = setup_initialized();

    // A directory squatting on the target name makes the open fail
    fs::create_dir(path.join("clash")).unwrap();

    assert!(volume.write(b"payload".to_vec(), "clash"));
    wait_written(&volume, "clash");

    assert!(!volume.is_written_to_db("clash"));
    assert!(!volume.is_currently_writing("clash"));
    assert_eq!(volume.root_file_count(), 0);

    fs::remove_dir(path.join("clash")).unwrap();
    assert!(volume.write(b"payload".to_vec(), "clash"));
    wait_written(&volume, "clash");

    assert!(volume.is_written_to_db("clash"));
    assert_eq!(fs::read(path.join("clash")).unwrap(), b"payload");
}

#[test]
fn test_write_failing_mid_file_removes_partial_file() {
    // /dev/full accepts the open but refuses truncation and every write
    if !Path::new("/dev/full").exists() {
        return;
    }
    let (_temp, _control, volume, path) = setup_initialized();
    let target = path.join("spill.bin");
    std::os::unix::fs::symlink("/dev/full", &target).unwrap();

    assert!(volume.write(vec![7u8; 4096], "spill.bin"));
    wait_written(&volume, "spill.bin");

    assert!(fs::symlink_metadata(&target).is_err());
    assert!(!volume.is_written_to_db("spill.bin"));
    assert!(!volume.is_currently_writing("spill.bin"));
    assert_eq!(volume.root_file_count(), 0);

    assert!(wait_until(|| volume.can_accept_write()));
    assert!(volume.write(vec![7u8; 4096], "spill.bin"));
    wait_written(&volume, "spill.bin");

    assert!(volume.is_written_to_db("spill.bin"));
    assert!(fs::symlink_metadata(&target).unwrap().file_type().is_file());
    assert_eq!(fs::read(&target).unwrap(), vec![7u8; 4096]);
}

// =============================================================================
// Validity Tests
// =============================================================================

#[test]
fn test_invalid_when_unmounted() {
    let (_temp, control, volume, path) = setup_initialized();
    assert!(volume.is_valid());

    control.force_unmount(DEVICE);
    assert!(!volume.is_valid());

    // Remounting does not bring it back
    assert!(control.mount(DEVICE, &path));
    assert!(!volume.is_valid());
    assert_eq!(volume.state(), VolumeState::Invalid);
}

#[test]
fn test_invalid_when_space_runs_low() {
    let (_temp, control, volume, _path) = setup_initialized();

    control.set_free_percent(DEVICE, 6);
    assert!(volume.is_valid());

    control.set_free_percent(DEVICE, 5);
    assert!(!volume.is_valid());

    control.set_free_percent(DEVICE, 90);
    assert!(!volume.is_valid());
}

#[test]
fn test_invalid_volume_refuses_writes() {
    let (_temp, control, volume, _path) = setup_initialized();
    control.detach(DEVICE);

    assert!(!volume.is_valid());
    assert!(!volume.write(b"x".to_vec(), "late"));
    assert!(!volume.reduce_root(10));
}

#[test]
fn test_free_percent_reports_control_value() {
    let (_temp, control, volume, _path) = setup_initialized();
    assert_eq!(volume.free_percent(), 80);

    control.set_free_percent(DEVICE, 33);
    assert_eq!(volume.free_percent(), 33);
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[test]
fn test_uninit_waits_for_writes_then_unmounts() {
    let (_temp, control, volume, _path) = setup_volume(slow_config(Path::new("."), 2));
    assert!(volume.init());

    assert!(volume.write(b"12345".to_vec(), "one"));
    assert!(volume.write(b"1234567890".to_vec(), "two"));

    volume.uninit();

    assert!(!volume.is_writing());
    assert!(volume.is_written_to_db("one"));
    assert!(volume.is_written_to_db("two"));
    assert_eq!(control.unmount_calls(), vec![DEVICE.to_string()]);
    assert_eq!(control.mounted_on(DEVICE), None);
    assert_eq!(volume.state(), VolumeState::Invalid);
}

#[test]
fn test_uninit_is_idempotent() {
    let (_temp, control, volume, _path) = setup_initialized();

    volume.uninit();
    volume.uninit();

    assert_eq!(control.unmount_calls().len(), 1);
    assert!(!volume.write(b"x".to_vec(), "after"));
}

#[test]
fn test_uninit_without_mount_does_not_unmount() {
    let placeholder = TempDir::new().unwrap();
    let (_temp, control, volume, _path) = setup_volume(test_config(placeholder.path()));

    volume.uninit();

    assert!(control.unmount_calls().is_empty());
    assert!(!volume.init());
}

#[test]
fn test_uninit_leaves_foreign_mount_in_place() {
    let (temp, control, owner, path) = setup_initialized();
    let config = test_config(temp.path());

    // Second volume finds the device already mounted on the same path
    let visitor = Volume::new(&path, DEVICE, control.clone(), &config).unwrap();
    assert!(visitor.init());
    assert_eq!(visitor.total_files(), owner.total_files());

    visitor.uninit();

    assert!(control.unmount_calls().is_empty());
    assert_eq!(control.mounted_on(DEVICE), Some(path.clone()));
    assert!(owner.is_valid());

    owner.uninit();
    assert_eq!(control.unmount_calls(), vec![DEVICE.to_string()]);
}

#[test]
fn test_failed_init_leaves_foreign_mount_in_place() {
    let (temp, control, owner, path) = setup_initialized();
    let config = Config {
        folder_probe_limit: 1,
        ..test_config(temp.path())
    };
    fs::create_dir(path.join("files_1")).unwrap();

    let visitor = Volume::new(&path, DEVICE, control.clone(), &config).unwrap();
    assert!(!visitor.init());

    assert!(control.unmount_calls().is_empty());
    assert!(owner.is_valid());
}

#[test]
fn test_stats_snapshot() {
    let (_temp, _control, volume, path) = setup_initialized();
    assert!(volume.write(b"x".to_vec(), "one"));
    wait_written(&volume, "one");

    let stats = volume.stats();
    assert_eq!(stats.device, DEVICE);
    assert_eq!(stats.mount_path, path);
    assert_eq!(stats.state, VolumeState::Valid);
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.root_files, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.next_folder_index, 1);
}
