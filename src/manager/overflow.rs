//! Overflow store
//!
//! A plain directory that takes forced writes when no volume can. Written
//! synchronously, never overwritten.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fsutil;

/// Fallback directory plus the names already in it
#[derive(Debug)]
pub struct OverflowStore {
    dir: PathBuf,
    names: HashSet<String>,
}

impl OverflowStore {
    /// Create the directory if needed and index the files already there
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fsutil::ensure_dir_full(&dir)?;

        let mut names = HashSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_string());
                }
            }
        }

        tracing::debug!(dir = %dir.display(), files = names.len(), "overflow store indexed");
        Ok(Self { dir, names })
    }

    /// Store `data` as `name` unless that name is already present
    ///
    /// `Ok(false)` means the name was taken and nothing was touched.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        if self.names.contains(name) {
            return Ok(false);
        }

        let path = self.dir.join(name);
        let mut file = match fsutil::create_new_file_full(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Put there by someone else; it still counts as stored
                self.names.insert(name.to_string());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = file.write_all(data).and_then(|()| file.sync_all()) {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path) {
                tracing::warn!(name, "failed to remove partial overflow file: {}", remove_err);
            }
            return Err(e.into());
        }

        self.names.insert(name.to_string());
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
