//! Filesystem helpers
//!
//! Everything the store creates (mount directories, subfolders, stored
//! files, the status file) is world read/write/execute so that other
//! processes on the host can pick files up regardless of who wrote them.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// rwxrwxrwx
pub const FULL_PERMISSIONS: u32 = 0o777;

/// Apply full permissions, overriding whatever the umask stripped
pub fn set_full_permissions(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, Permissions::from_mode(FULL_PERMISSIONS))
}

/// Create a single directory with full permissions
pub fn create_dir_full(path: &Path) -> io::Result<()> {
    fs::create_dir(path)?;
    set_full_permissions(path)
}

/// Create a directory with full permissions unless it already exists
pub fn ensure_dir_full(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    match create_dir_full(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

/// Create a file that must not exist yet, with full permissions
pub fn create_new_file_full(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(FULL_PERMISSIONS)
        .open(path)?;
    set_full_permissions(path)?;
    Ok(file)
}

/// Open a file for positional writes, creating it with full permissions if absent
pub fn open_or_create_full(path: &Path) -> io::Result<File> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(FULL_PERMISSIONS)
        .open(path)?;
    if !existed {
        set_full_permissions(path)?;
    }
    Ok(file)
}

/// Create an empty file with full permissions unless it already exists
pub fn ensure_file_full(path: &Path) -> io::Result<()> {
    match create_new_file_full(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
