//! Flat key-value file
//!
//! Loads and rewrites `key: value` files. Used both for the status snapshot
//! and for config overrides.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, UsbDbError};
use crate::fsutil;

use super::StatusStore;

/// Separator between key and value on each line
const SEPARATOR: &str = ": ";

/// In-memory view of a flat `key: value` file
#[derive(Debug, Clone)]
pub struct KvFile {
    /// Backing file
    path: PathBuf,

    /// Pairs, kept sorted so saved snapshots are stable
    data: BTreeMap<String, String>,
}

impl KvFile {
    /// Bind to a file path; nothing is read until `load()`
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: BTreeMap::new(),
        }
    }

    /// Merge the pairs stored in the backing file into memory
    pub fn load(&mut self) -> Result<()> {
        let content = fs::read_to_string(&self.path)?;
        self.load_lines(content.lines())
    }

    /// Merge pairs from already-read lines
    ///
    /// Nothing is merged if any line is malformed.
    pub fn load_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let parsed = Self::parse(lines)?;
        self.data.extend(parsed);
        Ok(())
    }

    /// Parse lines into pairs without touching any file
    ///
    /// Blank lines are skipped.
    pub fn parse<'a>(
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<BTreeMap<String, String>> {
        let mut parsed = BTreeMap::new();
        for (number, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once(SEPARATOR).ok_or_else(|| {
                UsbDbError::StatusStore(format!("line {}: missing \"{}\"", number + 1, SEPARATOR))
            })?;
            parsed.insert(key.to_string(), value.to_string());
        }
        Ok(parsed)
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Set a pair in memory
    pub fn set(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    /// Remove a pair from memory
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    /// Drop every pair and truncate the backing file
    pub fn clear(&mut self) {
        self.data.clear();
        if let Err(e) = File::create(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to truncate status file: {}", e);
        }
    }

    /// Rewrite the backing file with the in-memory pairs
    ///
    /// The new content goes to a sibling temp file that replaces the old one
    /// in a single rename, so readers never see a half-written snapshot.
    pub fn save(&self) -> bool {
        match self.try_save() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to save status file: {}", e);
                false
            }
        }
    }

    /// Append one pair to the backing file without rewriting it
    pub fn append(&mut self, key: &str, value: &str) -> bool {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}{}{}", key, SEPARATOR, value));

        match result {
            Ok(()) => {
                self.set(key, value);
                true
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to append to status file: {}", e);
                false
            }
        }
    }

    /// Iterate pairs in key order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs in memory
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn try_save(&self) -> Result<()> {
        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            for (key, value) in &self.data {
                writeln!(file, "{}{}{}", key, SEPARATOR, value)?;
            }
            file.sync_all()?;
        }
        // The rename carries the temp file's mode over to the snapshot
        fsutil::set_full_permissions(&tmp_path)?;

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl StatusStore for KvFile {
    fn clear(&mut self) {
        KvFile::clear(self)
    }

    fn set(&mut self, key: &str, value: &str) {
        KvFile::set(self, key, value)
    }

    fn save(&mut self) -> bool {
        KvFile::save(self)
    }
}
