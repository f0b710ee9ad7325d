//! Status Module
//!
//! Publishes a flat snapshot of the attached volumes for external readers.
//!
//! ## File Format
//! ```text
//! USBName_1: /dev/sdb1
//! USBPath_1: /srv/usbdb/db1
//! TotalFiles_1: 4210
//! USBStorage_1: 63
//! ```
//!
//! One `key: value` pair per line. Neither keys nor values may contain a
//! colon followed by a space.

mod kv_file;

pub use kv_file::KvFile;

/// Sink for the status snapshot written by each reconciliation pass
pub trait StatusStore: Send {
    /// Drop every pair, both in memory and in the backing file
    fn clear(&mut self);

    /// Set a pair in memory
    fn set(&mut self, key: &str, value: &str);

    /// Persist the in-memory pairs, replacing the previous snapshot
    fn save(&mut self) -> bool;
}
