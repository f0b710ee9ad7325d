//! Compaction job
//!
//! Keeps the volume root small by moving landed files into numbered
//! `files_<n>` subfolders. A subfolder is reused until it holds
//! `subfolder_capacity` files; after that a new one is created and the
//! folder index advances.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crate::error::{Result, UsbDbError};
use crate::fsutil;

use super::Shared;

/// Job body: move up to `amount` root files into the current subfolder
pub(super) fn run(shared: &Arc<Shared>, amount: usize) {
    let (folder, room) = match prepare_subfolder(shared) {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!(device = %shared.device, "compaction aborted: {}", e);
            return;
        }
    };

    let files = match root_files(&shared.mount_path) {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(device = %shared.device, "failed to list root: {}", e);
            return;
        }
    };

    let delay = shared.config.compaction_delay();
    let mut moved = 0usize;
    let mut skipped = 0usize;

    for name in files.iter().take(amount.min(room)) {
        let source = shared.mount_path.join(name);
        let destination = folder.join(name);

        let writing = shared.inner.lock().in_flight.contains(name);
        if writing || destination.exists() {
            skipped += 1;
        } else {
            match fs::rename(&source, &destination) {
                Ok(()) => {
                    let mut inner = shared.inner.lock();
                    inner.root_file_count = inner.root_file_count.saturating_sub(1);
                    moved += 1;
                }
                Err(e) => {
                    tracing::warn!(device = %shared.device, name = %name, "move failed: {}", e);
                    skipped += 1;
                }
            }
        }

        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    tracing::info!(
        device = %shared.device,
        folder = %folder.display(),
        moved,
        skipped,
        "compaction finished"
    );
}

/// Pick the subfolder to fill and how many more files it may take
fn prepare_subfolder(shared: &Shared) -> Result<(PathBuf, usize)> {
    let capacity = shared.config.subfolder_capacity;
    let limit = shared.config.folder_probe_limit;
    let mut index = shared.inner.lock().next_folder_index;

    if index == 0 {
        return Err(UsbDbError::NotInitialized(shared.device.clone()));
    }

    if index > 1 {
        let current = shared.subfolder(index - 1);
        if current.is_dir() {
            let held = count_files(&current)?;
            if held < capacity {
                return Ok((current, capacity - held));
            }
        }
    }

    loop {
        if index > limit {
            shared.inner.lock().folder_index_exhausted = true;
            return Err(UsbDbError::FolderIndexExhausted { limit });
        }

        let folder = shared.subfolder(index);
        match fsutil::create_dir_full(&folder) {
            Ok(()) => {
                shared.inner.lock().next_folder_index = index + 1;
                tracing::debug!(device = %shared.device, folder = %folder.display(), "created subfolder");
                return Ok((folder, capacity));
            }
            // Created behind our back; move past it
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Regular files directly in `dir`, sorted by name
fn root_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn count_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.file_type()?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}
