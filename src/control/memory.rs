//! In-memory volume control
//!
//! A device table held in a mutex. "Mounting" only records the path; files
//! still land in whatever real directory that path names, so tests point
//! mount points at temp directories.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{DeviceInfo, VolumeControl};

#[derive(Debug, Clone)]
struct FakeDevice {
    total_bytes: u64,
    free_percent: u8,
    mounted_on: Option<PathBuf>,
    fail_mount: bool,
}

#[derive(Debug, Default)]
struct ControlState {
    devices: BTreeMap<String, FakeDevice>,
    mount_calls: Vec<(String, PathBuf)>,
    unmount_calls: Vec<String>,
}

/// Fake device table for exercising volumes and the manager without hardware
#[derive(Debug, Default)]
pub struct MemoryVolumeControl {
    state: Mutex<ControlState>,
}

impl MemoryVolumeControl {
    /// Default capacity reported for attached devices (32 GB)
    pub const DEFAULT_TOTAL_BYTES: u64 = 32 * 1024 * 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device with the given free percentage
    pub fn attach(&self, device: &str, free_percent: u8) {
        self.state.lock().devices.insert(
            device.to_string(),
            FakeDevice {
                total_bytes: Self::DEFAULT_TOTAL_BYTES,
                free_percent: free_percent.min(100),
                mounted_on: None,
                fail_mount: false,
            },
        );
    }

    /// Pull a device out; its mount disappears with it
    pub fn detach(&self, device: &str) {
        self.state.lock().devices.remove(device);
    }

    /// Drop a device's mount without detaching it
    pub fn force_unmount(&self, device: &str) {
        if let Some(dev) = self.state.lock().devices.get_mut(device) {
            dev.mounted_on = None;
        }
    }

    pub fn set_free_percent(&self, device: &str, free_percent: u8) {
        if let Some(dev) = self.state.lock().devices.get_mut(device) {
            dev.free_percent = free_percent.min(100);
        }
    }

    /// Make every later mount of `device` fail
    pub fn fail_mounts(&self, device: &str) {
        if let Some(dev) = self.state.lock().devices.get_mut(device) {
            dev.fail_mount = true;
        }
    }

    /// Where `device` is mounted, if anywhere
    pub fn mounted_on(&self, device: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .devices
            .get(device)
            .and_then(|d| d.mounted_on.clone())
    }

    /// Every `mount` call so far, in order
    pub fn mount_calls(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().mount_calls.clone()
    }

    /// Every `unmount` call so far, in order
    pub fn unmount_calls(&self) -> Vec<String> {
        self.state.lock().unmount_calls.clone()
    }
}

impl VolumeControl for MemoryVolumeControl {
    fn mount(&self, device: &str, path: &Path) -> bool {
        let mut state = self.state.lock();
        state.mount_calls.push((device.to_string(), path.to_path_buf()));

        match state.devices.get_mut(device) {
            Some(dev) if !dev.fail_mount => match &dev.mounted_on {
                Some(existing) => existing == path,
                None => {
                    dev.mounted_on = Some(path.to_path_buf());
                    true
                }
            },
            _ => false,
        }
    }

    fn unmount(&self, device: &str) {
        let mut state = self.state.lock();
        state.unmount_calls.push(device.to_string());
        if let Some(dev) = state.devices.get_mut(device) {
            dev.mounted_on = None;
        }
    }

    fn list_attached_devices(&self) -> Vec<DeviceInfo> {
        self.state
            .lock()
            .devices
            .iter()
            .map(|(name, dev)| {
                let available_bytes = dev.total_bytes / 100 * u64::from(dev.free_percent);
                DeviceInfo {
                    device: name.clone(),
                    total_bytes: dev.total_bytes,
                    used_bytes: dev.total_bytes - available_bytes,
                    available_bytes,
                    used_percent: 100 - dev.free_percent,
                    mounted_on: dev.mounted_on.clone(),
                }
            })
            .collect()
    }

    fn mount_paths_for(&self, device: &str) -> HashSet<PathBuf> {
        self.mounted_on(device).into_iter().collect()
    }

    fn free_percent(&self, path: &Path, device: &str) -> u8 {
        let state = self.state.lock();
        match state.devices.get(device) {
            Some(dev) if dev.mounted_on.as_deref() == Some(path) => dev.free_percent,
            _ => 0,
        }
    }
}
