//! Volume Module
//!
//! One removable device mounted on one mount point.
//!
//! ## Responsibilities
//! - Mount the device and index the files already on it
//! - Accept throttled, chunked writes on a bounded writer pool
//! - Move root-level files into `files_<n>` subfolders (compaction)
//! - Track validity: mounted, folder index usable, free space above the floor
//! - Drain and unmount on teardown
//!
//! ## On-Device Layout
//! ```text
//! {mount_path}/
//!   ├── <name>            (fresh writes land in the root)
//!   ├── files_1/<name>    (compacted)
//!   └── files_2/<name>
//! ```
//!
//! ## State Machine
//! ```text
//! Uninitialized ──init() ok──▶ Valid ──any check fails──▶ Invalid (terminal)
//!       │                                                    ▲
//!       └──────────────init() fails──────────────────────────┘
//! ```

mod compactor;
mod pool;
mod writer;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::control::VolumeControl;
use crate::error::{Result, UsbDbError};
use crate::fsutil;

pub use pool::WorkerPool;

/// Prefix of compaction subfolders
pub const SUBFOLDER_PREFIX: &str = "files_";

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Uninitialized,
    Valid,
    Invalid,
}

/// Point-in-time copy of a volume's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    pub device: String,
    pub mount_path: PathBuf,
    pub state: VolumeState,
    pub total_files: usize,
    pub root_files: usize,
    pub in_flight: usize,
    pub next_folder_index: u32,
}

/// Reject names that would escape the store directory
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if bad {
        return Err(UsbDbError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Mutable bookkeeping, guarded by one mutex per volume
#[derive(Debug)]
struct VolumeInner {
    state: VolumeState,

    /// Names durably written to this device; only grows
    dedup: HashSet<String>,

    /// Names whose write job is queued or executing
    in_flight: HashSet<String>,

    /// Files sitting in the root directory
    root_file_count: usize,

    /// Index of the next subfolder to create; 0 until the probe succeeds
    next_folder_index: u32,

    /// Set when compaction ran past `folder_probe_limit`
    folder_index_exhausted: bool,

    /// Whether this volume mounted the device and still owes an unmount
    mounted: bool,
}

/// State shared between a volume handle and its worker jobs
struct Shared {
    mount_path: PathBuf,
    device: String,
    config: Config,
    control: Arc<dyn VolumeControl>,
    inner: Mutex<VolumeInner>,
}

impl Shared {
    fn subfolder(&self, index: u32) -> PathBuf {
        self.mount_path.join(format!("{}{}", SUBFOLDER_PREFIX, index))
    }
}

/// A storage area on one physical device
///
/// Jobs only hold the shared state, never the `Volume` itself, so dropping
/// the last handle joins the worker threads from outside the pool.
pub struct Volume {
    shared: Arc<Shared>,

    /// Chunked file writers
    writers: WorkerPool,

    /// Single compaction worker, no backlog
    compactor: WorkerPool,

    /// Serializes init/uninit
    lifecycle: Mutex<()>,
}

impl Volume {
    /// Create a volume for `device` on `mount_path`; call `init()` next
    pub fn new(
        mount_path: impl Into<PathBuf>,
        device: impl Into<String>,
        control: Arc<dyn VolumeControl>,
        config: &Config,
    ) -> Result<Self> {
        let mount_path = mount_path.into();
        let device = device.into();

        let label = device.rsplit('/').next().unwrap_or("dev").to_string();
        let writers = WorkerPool::new(
            &format!("usbdb-write-{}", label),
            config.max_writers,
            config.max_writers,
        )?;
        let compactor = WorkerPool::new(&format!("usbdb-compact-{}", label), 1, 0)?;

        Ok(Self {
            shared: Arc::new(Shared {
                mount_path,
                device,
                config: config.clone(),
                control,
                inner: Mutex::new(VolumeInner {
                    state: VolumeState::Uninitialized,
                    dedup: HashSet::new(),
                    in_flight: HashSet::new(),
                    root_file_count: 0,
                    next_folder_index: 0,
                    folder_index_exhausted: false,
                    mounted: false,
                }),
            }),
            writers,
            compactor,
            lifecycle: Mutex::new(()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mount the device and index its contents
    ///
    /// On success the volume is Valid. On failure it becomes Invalid for
    /// good; a retry needs a new `Volume`.
    pub fn init(&self) -> bool {
        let _guard = self.lifecycle.lock();

        match self.shared.inner.lock().state {
            VolumeState::Uninitialized => {}
            VolumeState::Valid => return true,
            VolumeState::Invalid => return false,
        }

        match self.try_init() {
            Ok(()) => {
                let inner = self.shared.inner.lock();
                tracing::info!(
                    device = %self.shared.device,
                    mount_path = %self.shared.mount_path.display(),
                    files = inner.dedup.len(),
                    root_files = inner.root_file_count,
                    next_folder = inner.next_folder_index,
                    "volume initialized"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    device = %self.shared.device,
                    mount_path = %self.shared.mount_path.display(),
                    "volume init failed: {}",
                    e
                );
                self.shared.inner.lock().state = VolumeState::Invalid;
                false
            }
        }
    }

    /// Stop admissions, wait for every job to finish, then unmount
    ///
    /// Never cancels a job; a job that never finishes blocks this forever.
    pub fn uninit(&self) {
        let _guard = self.lifecycle.lock();
        self.shared.inner.lock().state = VolumeState::Invalid;

        while !(self.writers.is_idle() && self.compactor.is_idle()) {
            tracing::debug!(
                device = %self.shared.device,
                writes = self.writers.outstanding(),
                compacting = !self.compactor.is_idle(),
                "waiting for volume to drain"
            );
            thread::sleep(self.shared.config.drain_poll());
        }

        let was_mounted = std::mem::replace(&mut self.shared.inner.lock().mounted, false);
        if was_mounted {
            self.shared.control.unmount(&self.shared.device);
            tracing::info!(
                device = %self.shared.device,
                mount_path = %self.shared.mount_path.display(),
                "volume torn down"
            );
        }
    }

    /// Re-check validity; once false, false forever
    pub fn is_valid(&self) -> bool {
        if self.shared.inner.lock().state != VolumeState::Valid {
            return false;
        }

        let shared = &self.shared;
        let mounted = shared
            .control
            .mount_paths_for(&shared.device)
            .contains(&shared.mount_path);
        let free = shared.control.free_percent(&shared.mount_path, &shared.device);

        let mut inner = shared.inner.lock();
        if inner.state != VolumeState::Valid {
            return false;
        }

        let folders_ok = inner.next_folder_index != 0 && !inner.folder_index_exhausted;
        let space_ok = free > shared.config.min_free_percent;
        if mounted && folders_ok && space_ok {
            return true;
        }

        inner.state = VolumeState::Invalid;
        tracing::warn!(
            device = %shared.device,
            mount_path = %shared.mount_path.display(),
            mounted,
            folders_ok,
            free_percent = free,
            "volume is no longer valid"
        );
        false
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Admission control: another write job would be accepted
    ///
    /// The bound is `2 × max_writers` outstanding jobs: `max_writers`
    /// executing plus up to `max_writers` waiting for a writer thread.
    pub fn can_accept_write(&self) -> bool {
        self.writers.has_capacity()
    }

    /// Queue an asynchronous write of `data` as `name`
    ///
    /// Returns whether the job was accepted, not whether it succeeded.
    /// Poll `is_written_to_db` / `is_currently_writing` for the outcome.
    pub fn write(&self, data: impl Into<Bytes>, name: &str) -> bool {
        if let Err(e) = validate_name(name) {
            tracing::warn!(device = %self.shared.device, "rejected write: {}", e);
            return false;
        }

        let mut inner = self.shared.inner.lock();
        if inner.state != VolumeState::Valid
            || inner.dedup.contains(name)
            || inner.in_flight.contains(name)
            || !self.writers.has_capacity()
        {
            return false;
        }

        inner.in_flight.insert(name.to_string());

        let shared = Arc::clone(&self.shared);
        let data = data.into();
        let job_name = name.to_string();
        if self.writers.try_execute(move || writer::run(&shared, &job_name, &data)) {
            true
        } else {
            inner.in_flight.remove(name);
            false
        }
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// True when no compaction job is queued or running
    pub fn can_reduce_root(&self) -> bool {
        self.compactor.is_idle()
    }

    /// Queue a job moving up to `amount` root files into a subfolder
    ///
    /// Returns whether the job was accepted.
    pub fn reduce_root(&self, amount: usize) -> bool {
        if self.shared.inner.lock().state != VolumeState::Valid || !self.can_reduce_root() {
            return false;
        }

        let shared = Arc::clone(&self.shared);
        self.compactor
            .try_execute(move || compactor::run(&shared, amount))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_written_to_db(&self, name: &str) -> bool {
        self.shared.inner.lock().dedup.contains(name)
    }

    pub fn is_currently_writing(&self, name: &str) -> bool {
        self.shared.inner.lock().in_flight.contains(name)
    }

    /// True while any write job is queued or running
    pub fn is_writing(&self) -> bool {
        !self.writers.is_idle()
    }

    /// True while the compaction job is queued or running
    pub fn is_compacting(&self) -> bool {
        !self.compactor.is_idle()
    }

    pub fn total_files(&self) -> usize {
        self.shared.inner.lock().dedup.len()
    }

    pub fn root_file_count(&self) -> usize {
        self.shared.inner.lock().root_file_count
    }

    pub fn next_folder_index(&self) -> u32 {
        self.shared.inner.lock().next_folder_index
    }

    pub fn state(&self) -> VolumeState {
        self.shared.inner.lock().state
    }

    /// Percentage of the device still free, as reported by the control
    pub fn free_percent(&self) -> u8 {
        self.shared
            .control
            .free_percent(&self.shared.mount_path, &self.shared.device)
    }

    pub fn mount_path(&self) -> &Path {
        &self.shared.mount_path
    }

    pub fn device(&self) -> &str {
        &self.shared.device
    }

    pub fn stats(&self) -> VolumeStats {
        let inner = self.shared.inner.lock();
        VolumeStats {
            device: self.shared.device.clone(),
            mount_path: self.shared.mount_path.clone(),
            state: inner.state,
            total_files: inner.dedup.len(),
            root_files: inner.root_file_count,
            in_flight: inner.in_flight.len(),
            next_folder_index: inner.next_folder_index,
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn try_init(&self) -> Result<()> {
        let shared = &self.shared;
        fsutil::ensure_dir_full(&shared.mount_path)?;

        // A mount found in place belongs to someone else; leave it on uninit
        let preexisting = shared
            .control
            .mount_paths_for(&shared.device)
            .contains(&shared.mount_path);

        if !shared.control.mount(&shared.device, &shared.mount_path) {
            return Err(UsbDbError::MountFailure {
                device: shared.device.clone(),
                path: shared.mount_path.clone(),
            });
        }
        shared.inner.lock().mounted = !preexisting;

        let indexed = probe_folder_index(&shared.mount_path, shared.config.folder_probe_limit)
            .and_then(|index| scan_files(&shared.mount_path).map(|scan| (index, scan)));

        let (index, (dedup, root_files)) = match indexed {
            Ok(indexed) => indexed,
            Err(e) => {
                let was_mounted = std::mem::replace(&mut shared.inner.lock().mounted, false);
                if was_mounted {
                    shared.control.unmount(&shared.device);
                }
                return Err(e);
            }
        };

        let mut inner = shared.inner.lock();
        inner.next_folder_index = index;
        inner.dedup = dedup;
        inner.root_file_count = root_files;
        inner.state = VolumeState::Valid;
        Ok(())
    }
}

/// First `files_<i>` (1..=limit) that does not exist yet
fn probe_folder_index(root: &Path, limit: u32) -> Result<u32> {
    (1..=limit)
        .find(|i| !root.join(format!("{}{}", SUBFOLDER_PREFIX, i)).exists())
        .ok_or(UsbDbError::FolderIndexExhausted { limit })
}

/// Names of files in the root and one level of subfolders, plus the root count
fn scan_files(root: &Path) -> Result<(HashSet<String>, usize)> {
    let mut names = HashSet::new();
    let mut root_files = 0;

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        if file_type.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
                root_files += 1;
            }
        } else if file_type.is_dir() {
            for sub in fs::read_dir(entry.path())? {
                let sub = sub?;
                if sub.file_type()?.is_file() {
                    if let Some(name) = sub.file_name().to_str() {
                        names.insert(name.to_string());
                    }
                }
            }
        }
    }

    Ok((names, root_files))
}
