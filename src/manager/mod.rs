//! Manager Module
//!
//! Owns the set of attached volumes and routes every save.
//!
//! ## Responsibilities
//! - Hand out mount points `db1..dbN` to newly attached devices
//! - Place each write on the first volume with capacity (first-fit)
//! - Fall back to the overflow store for forced writes
//! - Answer "is this name stored / being stored" across all volumes
//! - Run the reconciliation loop (see `reconciler`)
//!
//! ## Concurrency
//! - All bookkeeping sits behind one mutex (`state`)
//! - Volume teardown drains *outside* that mutex; a draining volume stays
//!   in the active list, never selected because it is invalid, until it has
//!   unmounted. So `volumes + free_mounts == max_volumes` at every point the
//!   lock is released.

mod overflow;
mod placement;
mod reconciler;

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::control::VolumeControl;
use crate::error::Result;
use crate::fsutil;
use crate::status::{KvFile, StatusStore};
use crate::volume::{validate_name, Volume, VolumeStats};

pub use overflow::OverflowStore;
pub use placement::{first_fit, Candidate};
pub use reconciler::{ReconcileReport, Reconciler};

/// Bookkeeping guarded by the manager mutex
struct ManagerState {
    /// Attached volumes, in attach order (placement order)
    volumes: Vec<Arc<Volume>>,

    /// Mount points not backing any volume
    free_mounts: VecDeque<PathBuf>,

    /// Fallback store; None until `init()`
    overflow: Option<OverflowStore>,
}

/// Coordinates volumes, the overflow store and status publishing
pub struct Manager {
    config: Config,
    control: Arc<dyn VolumeControl>,
    status: Mutex<Box<dyn StatusStore>>,
    state: Mutex<ManagerState>,

    /// Set by `uninit()`; the manager refuses work afterwards
    closed: AtomicBool,
}

impl Manager {
    /// Create a manager; call `init()` before saving anything
    pub fn new(
        config: Config,
        control: Arc<dyn VolumeControl>,
        status: Box<dyn StatusStore>,
    ) -> Self {
        Self {
            config,
            control,
            status: Mutex::new(status),
            state: Mutex::new(ManagerState {
                volumes: Vec::new(),
                free_mounts: VecDeque::new(),
                overflow: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a manager publishing status to `<info_dir>/usb_drives.info`
    pub fn with_status_file(config: Config, control: Arc<dyn VolumeControl>) -> Self {
        let status = KvFile::open(config.status_path());
        Self::new(config, control, Box::new(status))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Prepare directories, attach present devices, index the overflow store
    ///
    /// Steps:
    /// 1. Allocate the mount-point slots under `root_dir`
    /// 2. Ensure the overflow directory and status file exist
    /// 3. Let the volume control prepare itself
    /// 4. Attach devices that are already plugged in
    pub fn init(&self) -> Result<()> {
        self.config.validate()?;

        let mut state = self.state.lock();
        if state.overflow.is_some() {
            return Ok(());
        }

        // Step 1: Mount points live under the canonical root so they compare
        // equal to what the mount table reports
        fs::create_dir_all(&self.config.root_dir)?;
        let root = fs::canonicalize(&self.config.root_dir)?;
        state.free_mounts = (1..=self.config.max_volumes)
            .map(|i| root.join(format!("db{}", i)))
            .collect();

        // Step 2: Overflow store and status file
        let overflow = OverflowStore::open(root.join(Config::OVERFLOW_DIR))?;
        fs::create_dir_all(&self.config.info_dir)?;
        fsutil::ensure_file_full(&self.config.status_path())?;

        // Step 3: Collaborator setup
        self.control.prepare()?;

        // Step 4: Devices already attached
        let attached = self.attach_devices(&mut state);
        state.overflow = Some(overflow);

        tracing::info!(
            root = %root.display(),
            attached,
            max_volumes = self.config.max_volumes,
            "manager initialized"
        );
        Ok(())
    }

    /// Drain and unmount every volume; the manager is unusable afterwards
    pub fn uninit(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let volumes: Vec<Arc<Volume>> = self.state.lock().volumes.clone();
        for volume in &volumes {
            volume.uninit();
        }

        let mut state = self.state.lock();
        let drained: Vec<Arc<Volume>> = state.volumes.drain(..).collect();
        for volume in drained {
            release_mount(&mut state.free_mounts, volume.mount_path().to_path_buf());
        }
        tracing::info!(volumes = volumes.len(), "manager shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Save `data` as `name`
    ///
    /// - A volume with capacity gets an asynchronous write; the return value
    ///   is acceptance, not completion
    /// - With no such volume and `force`, the file is written synchronously
    ///   to the overflow store unless the name is already there
    /// - A name that is already stored or being written is never written
    ///   again; the call returns false
    pub fn save(&self, data: impl Into<Bytes>, name: &str, force: bool) -> bool {
        if let Err(e) = validate_name(name) {
            tracing::warn!("rejected save: {}", e);
            return false;
        }
        if self.is_closed() {
            return false;
        }

        let mut state = self.state.lock();
        let Some(overflow) = state.overflow.as_ref() else {
            return false;
        };

        let known = overflow.contains(name)
            || state
                .volumes
                .iter()
                .any(|v| v.is_written_to_db(name) || v.is_currently_writing(name));
        if known {
            tracing::debug!(name, "already stored or in flight");
            return false;
        }

        if let Some(volume) = first_fit(&state.volumes) {
            return volume.write(data, name);
        }

        if !force {
            return false;
        }

        let data = data.into();
        let Some(overflow) = state.overflow.as_mut() else {
            return false;
        };
        match overflow.write(name, &data) {
            Ok(stored) => {
                if stored {
                    tracing::debug!(name, bytes = data.len(), "saved to overflow store");
                }
                stored
            }
            Err(e) => {
                tracing::warn!(name, "overflow write failed: {}", e);
                false
            }
        }
    }

    /// Queue compaction on every valid volume whose root holds more than
    /// `threshold` files; returns how many jobs were queued
    pub fn reduce_roots(&self, threshold: usize, amount: usize) -> usize {
        let state = self.state.lock();
        state
            .volumes
            .iter()
            .filter(|v| v.root_file_count() > threshold && v.can_reduce_root() && v.is_valid())
            .filter(|v| v.reduce_root(amount))
            .count()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// True if `name` is durably stored on a volume or in the overflow store
    pub fn is_written_to_db(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.volumes.iter().any(|v| v.is_written_to_db(name))
            || state.overflow.as_ref().is_some_and(|o| o.contains(name))
    }

    /// True if a volume has a write of `name` queued or running
    pub fn is_currently_writing(&self, name: &str) -> bool {
        self.state
            .lock()
            .volumes
            .iter()
            .any(|v| v.is_currently_writing(name))
    }

    /// Files on all volumes plus the overflow store
    pub fn total_files(&self) -> usize {
        let state = self.state.lock();
        state.volumes.iter().map(|v| v.total_files()).sum::<usize>()
            + state.overflow.as_ref().map_or(0, OverflowStore::len)
    }

    /// Files in the overflow store
    pub fn total_overflow_files(&self) -> usize {
        self.state
            .lock()
            .overflow
            .as_ref()
            .map_or(0, OverflowStore::len)
    }

    /// Mean free percentage across attached volumes; 0 with none attached
    pub fn storage_left(&self) -> u8 {
        let state = self.state.lock();
        if state.volumes.is_empty() {
            return 0;
        }
        let sum: usize = state
            .volumes
            .iter()
            .map(|v| usize::from(v.free_percent()))
            .sum();
        (sum / state.volumes.len()) as u8
    }

    /// Device nodes of the attached volumes, in placement order
    pub fn usb_drive_names(&self) -> Vec<String> {
        self.state
            .lock()
            .volumes
            .iter()
            .map(|v| v.device().to_string())
            .collect()
    }

    /// Snapshot of every attached volume
    pub fn volumes(&self) -> Vec<VolumeStats> {
        self.state.lock().volumes.iter().map(|v| v.stats()).collect()
    }

    pub fn active_volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn free_mount_points(&self) -> Vec<PathBuf> {
        self.state.lock().free_mounts.iter().cloned().collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Give each unclaimed device a free mount point; returns how many attached
    fn attach_devices(&self, state: &mut ManagerState) -> usize {
        if state.free_mounts.is_empty() {
            return 0;
        }

        let mut attached = 0;
        for device in self.control.list_attached_devices() {
            if state.volumes.iter().any(|v| v.device() == device.device) {
                continue;
            }
            let Some(mount_path) = state.free_mounts.front().cloned() else {
                break;
            };

            let volume = match Volume::new(
                mount_path,
                device.device.clone(),
                Arc::clone(&self.control),
                &self.config,
            ) {
                Ok(volume) => volume,
                Err(e) => {
                    tracing::warn!(device = %device.device, "failed to create volume: {}", e);
                    continue;
                }
            };

            if volume.init() {
                state.free_mounts.pop_front();
                state.volumes.push(Arc::new(volume));
                attached += 1;
            }
        }
        attached
    }
}

fn release_mount(free_mounts: &mut VecDeque<PathBuf>, mount_path: PathBuf) {
    if !free_mounts.contains(&mount_path) {
        free_mounts.push_back(mount_path);
    }
}
