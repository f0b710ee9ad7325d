//! Volume Control Module
//!
//! Everything that touches the host's block devices: mounting, unmounting,
//! device enumeration and free-space probes.
//!
//! ## Implementations
//! - `SystemVolumeControl`: shells out to mount/umount/df/udevadm and reads
//!   `/proc/mounts`
//! - `MemoryVolumeControl`: in-process device table, for tests and benches
//!
//! Volumes and the manager only ever see the `VolumeControl` trait.

mod memory;
mod system;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use memory::MemoryVolumeControl;
pub use system::{
    decode_mount_field, mount_succeeded, parse_df_free, parse_df_line, parse_proc_mounts,
    DfEntry, SystemVolumeControl, LIST_DEVICES_SCRIPT,
};

/// One attached block device, as enumerated by the control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device node, e.g. `/dev/sdb1`
    pub device: String,

    /// Capacity in bytes
    pub total_bytes: u64,

    /// Bytes in use (0 when the device is not mounted anywhere)
    pub used_bytes: u64,

    /// Bytes available (0 when the device is not mounted anywhere)
    pub available_bytes: u64,

    /// Percentage of capacity in use
    pub used_percent: u8,

    /// Where the device is currently mounted, if anywhere
    pub mounted_on: Option<PathBuf>,
}

impl DeviceInfo {
    /// A device with only its node known
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            total_bytes: 0,
            used_bytes: 0,
            available_bytes: 0,
            used_percent: 0,
            mounted_on: None,
        }
    }
}

/// Host-side operations on removable devices
///
/// All methods report failure through their return value; none of them
/// may panic on a missing or vanished device.
pub trait VolumeControl: Send + Sync {
    /// One-time setup before first use (helper scripts, directories)
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Mount `device` on `path`; true if it is mounted there afterwards
    fn mount(&self, device: &str, path: &Path) -> bool;

    /// Unmount `device`; failures are logged, not reported
    fn unmount(&self, device: &str);

    /// Devices currently attached to the host
    fn list_attached_devices(&self) -> Vec<DeviceInfo>;

    /// Every path `device` is mounted on right now
    fn mount_paths_for(&self, device: &str) -> HashSet<PathBuf>;

    /// Percentage of space still free under `path` (0..=100)
    ///
    /// 0 on any failure, or when `device` is not mounted.
    fn free_percent(&self, path: &Path, device: &str) -> u8;
}
