//! Error types for usbdb
//!
//! Provides a unified error type for all internal operations. The public
//! volume/manager operations report outcomes as booleans; these errors are
//! what gets logged on the way there.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using UsbDbError
pub type Result<T> = std::result::Result<T, UsbDbError>;

/// Unified error type for usbdb operations
#[derive(Debug, Error)]
pub enum UsbDbError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Volume Errors
    // -------------------------------------------------------------------------
    #[error("failed to mount {device} on {}", path.display())]
    MountFailure { device: String, path: PathBuf },

    #[error("no free subfolder index at or below {limit}")]
    FolderIndexExhausted { limit: u32 },

    #[error("volume {0} is not initialized")]
    NotInitialized(String),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    // -------------------------------------------------------------------------
    // Collaborator Errors
    // -------------------------------------------------------------------------
    #[error("Volume control error: {0}")]
    VolumeControl(String),

    #[error("Status store error: {0}")]
    StatusStore(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
