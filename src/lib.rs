//! # usbdb
//!
//! A non-redundant, low-resource file store spread over removable drives:
//! - Each file name is persisted at most once across every drive
//! - Writes are chunked and throttled; each drive bounds its concurrent writers
//! - Drives may vanish, fill up or break at any time; the store keeps going
//! - A fallback directory takes forced writes when no drive can
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   save(data, name, force)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Manager                               │
//! │       (first-fit placement, dedup lookups, mount slots)      │
//! └──────┬──────────────────────┬──────────────────────┬────────┘
//!        │                      │                      │
//!        ▼                      ▼                      ▼
//!  ┌───────────┐         ┌───────────┐         ┌──────────────┐
//!  │  Volume   │  ...    │  Volume   │         │   Overflow   │
//!  │ (writers, │         │ (writers, │         │    Store     │
//!  │ compactor)│         │ compactor)│         └──────────────┘
//!  └─────┬─────┘         └─────┬─────┘
//!        │                     │
//!        ▼                     ▼
//!  ┌─────────────────────────────────────┐     ┌──────────────┐
//!  │           VolumeControl             │     │ StatusStore  │
//!  │   (mount / unmount / enumerate)     │     │ (key: value) │
//!  └─────────────────────────────────────┘     └──────────────┘
//!
//!  Reconciler thread, every ~10s: prune invalid volumes ─▶ attach new
//!  devices ─▶ publish status
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod fsutil;

pub mod status;
pub mod control;
pub mod volume;
pub mod manager;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, UsbDbError};
pub use config::Config;
pub use control::{DeviceInfo, MemoryVolumeControl, SystemVolumeControl, VolumeControl};
pub use manager::{Manager, Reconciler};
pub use status::{KvFile, StatusStore};
pub use volume::{Volume, VolumeState, VolumeStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of usbdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
