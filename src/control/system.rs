//! System volume control
//!
//! Drives real devices through the host's mount tooling.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Config;
use crate::error::{Result, UsbDbError};
use crate::fsutil;

use super::{DeviceInfo, VolumeControl};

/// Lists the sysfs entries of block devices sitting on the USB bus
pub const LIST_DEVICES_SCRIPT: &str = "for device in /sys/block/*
do
    if udevadm info --query=property --path=$device | grep -q ^ID_BUS=usb
    then
        echo $device
    fi
done
";

const LIST_DEVICES_FILENAME: &str = "listDevices.sh";
const PROC_MOUNTS: &str = "/proc/mounts";
const SYS_BLOCK: &str = "/sys/block";
const SECTOR_SIZE: u64 = 512;

/// Volume control backed by mount/umount/df and `/proc/mounts`
#[derive(Debug, Clone)]
pub struct SystemVolumeControl {
    /// Where helper scripts are installed
    scripts_dir: PathBuf,

    /// Prefix privileged commands with sudo
    use_sudo: bool,

    /// Mount table to read (normally `/proc/mounts`)
    mounts_file: PathBuf,
}

impl SystemVolumeControl {
    pub fn new(scripts_dir: impl Into<PathBuf>, use_sudo: bool) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            use_sudo,
            mounts_file: PathBuf::from(PROC_MOUNTS),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.scripts_dir, config.use_sudo)
    }

    /// Read the mount table from somewhere other than `/proc/mounts`
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn command(&self, program: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn list_devices_script(&self) -> PathBuf {
        self.scripts_dir.join(LIST_DEVICES_FILENAME)
    }

    /// USB disk names (`sdb`, `sdc`, ...) from the helper script
    fn usb_disks(&self) -> Result<Vec<String>> {
        let output = Command::new("sh").arg(self.list_devices_script()).output()?;
        if !output.status.success() {
            return Err(UsbDbError::VolumeControl(format!(
                "{} exited with {}",
                LIST_DEVICES_FILENAME, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| line.trim().rsplit('/').next())
            .filter(|name| name.starts_with("sd"))
            .map(str::to_string)
            .collect())
    }

    /// Partition names of a disk, or the disk itself when unpartitioned
    fn partitions(disk: &str) -> Vec<String> {
        let mut parts: Vec<String> = fs::read_dir(Path::new(SYS_BLOCK).join(disk))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with(disk) && name.len() > disk.len())
                    .collect()
            })
            .unwrap_or_default();

        if parts.is_empty() {
            parts.push(disk.to_string());
        }
        parts.sort();
        parts
    }

    fn sysfs_size_bytes(name: &str) -> u64 {
        fs::read_to_string(Path::new("/sys/class/block").join(name).join("size"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * SECTOR_SIZE)
            .unwrap_or(0)
    }

    /// `df -B1` rows keyed by device node
    fn df_table(&self) -> HashMap<String, DfEntry> {
        let output = match self.command("df").arg("-B1").output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("df failed: {}", e);
                return HashMap::new();
            }
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter_map(parse_df_line)
            .map(|entry| (entry.device.clone(), entry))
            .collect()
    }
}

impl VolumeControl for SystemVolumeControl {
    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.scripts_dir)?;

        let script = self.list_devices_script();
        if !script.exists() {
            fs::write(&script, LIST_DEVICES_SCRIPT)?;
            fsutil::set_full_permissions(&script)?;
            tracing::debug!(path = %script.display(), "installed helper script");
        }
        Ok(())
    }

    fn mount(&self, device: &str, path: &Path) -> bool {
        let output = match self.command("mount").arg(device).arg(path).output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(device, "failed to run mount: {}", e);
                return false;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mounted = mount_succeeded(output.status.success(), &stderr, path);
        if !mounted {
            tracing::warn!(device, mount_path = %path.display(), "mount failed: {}", stderr.trim());
        }
        mounted
    }

    fn unmount(&self, device: &str) {
        match self.command("umount").arg(device).output() {
            Ok(output) if output.status.success() => {
                tracing::debug!(device, "unmounted");
            }
            Ok(output) => {
                tracing::warn!(
                    device,
                    "umount failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => tracing::warn!(device, "failed to run umount: {}", e),
        }
    }

    fn list_attached_devices(&self) -> Vec<DeviceInfo> {
        let disks = match self.usb_disks() {
            Ok(disks) => disks,
            Err(e) => {
                tracing::warn!("failed to enumerate usb devices: {}", e);
                return Vec::new();
            }
        };

        let df = self.df_table();
        disks
            .iter()
            .flat_map(|disk| Self::partitions(disk))
            .map(|name| {
                let node = format!("/dev/{}", name);
                match df.get(&node) {
                    Some(entry) => DeviceInfo {
                        device: node,
                        total_bytes: entry.total_bytes,
                        used_bytes: entry.used_bytes,
                        available_bytes: entry.available_bytes,
                        used_percent: entry.used_percent,
                        mounted_on: Some(entry.mounted_on.clone()),
                    },
                    None => DeviceInfo {
                        total_bytes: Self::sysfs_size_bytes(&name),
                        ..DeviceInfo::new(node)
                    },
                }
            })
            .collect()
    }

    fn mount_paths_for(&self, device: &str) -> HashSet<PathBuf> {
        match fs::read_to_string(&self.mounts_file) {
            Ok(content) => parse_proc_mounts(&content, device),
            Err(e) => {
                tracing::warn!(path = %self.mounts_file.display(), "failed to read mount table: {}", e);
                HashSet::new()
            }
        }
    }

    fn free_percent(&self, path: &Path, device: &str) -> u8 {
        if self.mount_paths_for(device).is_empty() {
            return 0;
        }

        let output = match self
            .command("df")
            .args(["-B1", "--output=size,avail"])
            .arg(path)
            .output()
        {
            Ok(output) if output.status.success() => output,
            _ => return 0,
        };

        parse_df_free(&String::from_utf8_lossy(&output.stdout)).unwrap_or(0)
    }
}

// =============================================================================
// Parsers
// =============================================================================

/// One data row of `df -B1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfEntry {
    pub device: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: u8,
    pub mounted_on: PathBuf,
}

/// Parse a `df -B1` data row
///
/// `/dev/sdb1 31000000000 1000000000 30000000000 4% /media/usb` → DfEntry
pub fn parse_df_line(line: &str) -> Option<DfEntry> {
    let mut fields = line.split_whitespace();
    let device = fields.next()?.to_string();
    let total_bytes = fields.next()?.parse().ok()?;
    let used_bytes = fields.next()?.parse().ok()?;
    let available_bytes = fields.next()?.parse().ok()?;
    let used_percent = fields.next()?.trim_end_matches('%').parse().ok()?;

    // Mount points may contain spaces; df prints them raw
    let mounted_on: Vec<&str> = fields.collect();
    if mounted_on.is_empty() {
        return None;
    }

    Some(DfEntry {
        device,
        total_bytes,
        used_bytes,
        available_bytes,
        used_percent,
        mounted_on: PathBuf::from(mounted_on.join(" ")),
    })
}

/// Free percentage from `df -B1 --output=size,avail <path>`
pub fn parse_df_free(output: &str) -> Option<u8> {
    let row = output.lines().skip(1).find(|l| !l.trim().is_empty())?;
    let mut fields = row.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let avail: u64 = fields.next()?.parse().ok()?;
    if size == 0 {
        return None;
    }
    let percent = (avail as u128 * 100 / size as u128).min(100);
    Some(percent as u8)
}

/// Every mount point of `device` listed in a `/proc/mounts` style table
pub fn parse_proc_mounts(content: &str, device: &str) -> HashSet<PathBuf> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            (source == device).then(|| PathBuf::from(decode_mount_field(target)))
        })
        .collect()
}

/// Undo the octal escaping the kernel applies to mount table fields
///
/// `/media/my\040drive` → `/media/my drive`
pub fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Interpret the result of a `mount` invocation
///
/// Success is a clean exit with nothing on stderr, or the device already
/// being mounted on the requested path.
pub fn mount_succeeded(exit_ok: bool, stderr: &str, path: &Path) -> bool {
    if exit_ok && stderr.trim().is_empty() {
        return true;
    }

    let target = path.to_string_lossy();
    let target = target.trim_end_matches('/');
    stderr.lines().any(|line| names_mount_target(line, target))
}

/// `line` reports a mount on exactly `target`, not on a longer sibling path
fn names_mount_target(line: &str, target: &str) -> bool {
    const MARKER: &str = "already mounted on ";

    line.match_indices(MARKER).any(|(at, _)| {
        let Some(rest) = line[at + MARKER.len()..].strip_prefix(target) else {
            return false;
        };
        match rest.chars().next() {
            None => true,
            Some(c) => c == '.' || c.is_whitespace(),
        }
    })
}
