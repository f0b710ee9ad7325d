//! Configuration for usbdb
//!
//! Centralized configuration with sensible defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UsbDbError};
use crate::status::KvFile;

/// Main configuration for a usbdb manager
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Directory Layout
    // -------------------------------------------------------------------------
    /// Root directory for mount points and the overflow store
    /// Internal structure:
    ///   {root_dir}/
    ///     ├── db1/ .. dbN/     (mount points, one per volume slot)
    ///     └── default/         (overflow store)
    pub root_dir: PathBuf,

    /// Directory holding the `usb_drives.info` status snapshot
    pub info_dir: PathBuf,

    /// Directory where the system volume control installs its helper scripts
    pub scripts_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Volume Configuration
    // -------------------------------------------------------------------------
    /// Number of mount-point slots (upper bound on attached volumes)
    pub max_volumes: usize,

    /// Writer threads per volume
    pub max_writers: usize,

    /// Sleep between chunk writes (milliseconds)
    pub write_rate_ms: u64,

    /// Bytes per positional write
    pub chunk_size: usize,

    /// Sleep between compaction moves (milliseconds)
    pub compaction_delay_ms: u64,

    /// Max files per `files_<n>` subfolder before compaction opens a new one
    pub subfolder_capacity: usize,

    /// Highest subfolder index a volume may use
    pub folder_probe_limit: u32,

    /// A volume stays valid only while free space is strictly above this
    pub min_free_percent: u8,

    // -------------------------------------------------------------------------
    // Manager Configuration
    // -------------------------------------------------------------------------
    /// Reconciliation period (milliseconds)
    pub reconcile_interval_ms: u64,

    /// Retry interval while a volume drains during teardown (milliseconds)
    pub drain_poll_ms: u64,

    /// Prefix mount/umount/df invocations with sudo
    pub use_sudo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./usbdb"),
            info_dir: PathBuf::from("./usbdb"),
            scripts_dir: PathBuf::from("./usbdb/scripts"),
            max_volumes: 4,
            max_writers: 4,
            write_rate_ms: 100,
            chunk_size: 512_000,
            compaction_delay_ms: 1000,
            subfolder_capacity: 1000,
            folder_probe_limit: 1000,
            min_free_percent: 5,
            reconcile_interval_ms: 10_000,
            drain_poll_ms: 5000,
            use_sudo: true,
        }
    }
}

impl Config {
    /// Name of the status snapshot file inside `info_dir`
    pub const STATUS_FILENAME: &'static str = "usb_drives.info";

    /// Name of the overflow directory inside `root_dir`
    pub const OVERFLOW_DIR: &'static str = "default";

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load a config from a `key: value` file, starting from the defaults
    ///
    /// Keys match the field names. Booleans accept `true`/`false`.
    pub fn from_kv_file(path: &Path) -> Result<Self> {
        let mut file = KvFile::open(path);
        file.load()
            .map_err(|e| UsbDbError::Config(format!("{}: {}", path.display(), e)))?;

        let mut config = Config::default();
        for (key, value) in file.entries() {
            config.apply(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the volume and manager code rely on
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| Err(UsbDbError::Config(format!("{} must be positive", name)));

        if self.max_volumes == 0 {
            return zero("max_volumes");
        }
        if self.max_writers == 0 {
            return zero("max_writers");
        }
        if self.chunk_size == 0 {
            return zero("chunk_size");
        }
        if self.subfolder_capacity == 0 {
            return zero("subfolder_capacity");
        }
        if self.folder_probe_limit == 0 {
            return zero("folder_probe_limit");
        }
        if self.min_free_percent > 100 {
            return Err(UsbDbError::Config(format!(
                "min_free_percent must be at most 100, got {}",
                self.min_free_percent
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Derived Values
    // =========================================================================

    /// Status snapshot file
    pub fn status_path(&self) -> PathBuf {
        self.info_dir.join(Self::STATUS_FILENAME)
    }

    pub fn write_rate(&self) -> Duration {
        Duration::from_millis(self.write_rate_ms)
    }

    pub fn compaction_delay(&self) -> Duration {
        Duration::from_millis(self.compaction_delay_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "root_dir" => self.root_dir = PathBuf::from(value),
            "info_dir" => self.info_dir = PathBuf::from(value),
            "scripts_dir" => self.scripts_dir = PathBuf::from(value),
            "max_volumes" => self.max_volumes = parse_field(key, value)?,
            "max_writers" => self.max_writers = parse_field(key, value)?,
            "write_rate_ms" => self.write_rate_ms = parse_field(key, value)?,
            "chunk_size" => self.chunk_size = parse_field(key, value)?,
            "compaction_delay_ms" => self.compaction_delay_ms = parse_field(key, value)?,
            "subfolder_capacity" => self.subfolder_capacity = parse_field(key, value)?,
            "folder_probe_limit" => self.folder_probe_limit = parse_field(key, value)?,
            "min_free_percent" => self.min_free_percent = parse_field(key, value)?,
            "reconcile_interval_ms" => self.reconcile_interval_ms = parse_field(key, value)?,
            "drain_poll_ms" => self.drain_poll_ms = parse_field(key, value)?,
            "use_sudo" => self.use_sudo = parse_field(key, value)?,
            other => {
                return Err(UsbDbError::Config(format!("unknown key: {}", other)));
            }
        }
        Ok(())
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| UsbDbError::Config(format!("invalid value for {}: {:?}", key, value)))
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the root directory (mount points and overflow store)
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_dir = path.into();
        self
    }

    /// Set the directory for the status snapshot
    pub fn info_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.info_dir = path.into();
        self
    }

    /// Set the directory for helper scripts
    pub fn scripts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scripts_dir = path.into();
        self
    }

    /// Set the number of mount-point slots
    pub fn max_volumes(mut self, count: usize) -> Self {
        self.config.max_volumes = count;
        self
    }

    /// Set the writer threads per volume
    pub fn max_writers(mut self, count: usize) -> Self {
        self.config.max_writers = count;
        self
    }

    /// Set the sleep between chunk writes (in milliseconds)
    pub fn write_rate_ms(mut self, ms: u64) -> Self {
        self.config.write_rate_ms = ms;
        self
    }

    /// Set the chunk size (in bytes)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the sleep between compaction moves (in milliseconds)
    pub fn compaction_delay_ms(mut self, ms: u64) -> Self {
        self.config.compaction_delay_ms = ms;
        self
    }

    /// Set the per-subfolder file limit
    pub fn subfolder_capacity(mut self, count: usize) -> Self {
        self.config.subfolder_capacity = count;
        self
    }

    /// Set the highest subfolder index
    pub fn folder_probe_limit(mut self, limit: u32) -> Self {
        self.config.folder_probe_limit = limit;
        self
    }

    /// Set the free-space floor (in percent)
    pub fn min_free_percent(mut self, percent: u8) -> Self {
        self.config.min_free_percent = percent;
        self
    }

    /// Set the reconciliation period (in milliseconds)
    pub fn reconcile_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconcile_interval_ms = ms;
        self
    }

    /// Set the teardown drain retry interval (in milliseconds)
    pub fn drain_poll_ms(mut self, ms: u64) -> Self {
        self.config.drain_poll_ms = ms;
        self
    }

    /// Enable or disable sudo for system commands
    pub fn use_sudo(mut self, enabled: bool) -> Self {
        self.config.use_sudo = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
