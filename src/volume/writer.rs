//! Write job
//!
//! Streams one payload into the volume root in fixed-size chunks at
//! increasing offsets, sleeping between chunks to keep the device's I/O
//! rate down.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::fsutil;

use super::Shared;

/// Removes a name from the in-flight set when the job ends, however it ends
struct InFlightGuard<'a> {
    shared: &'a Shared,
    name: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.shared.inner.lock().in_flight.remove(self.name);
    }
}

/// Job body: write, then record the name only if every chunk landed
pub(super) fn run(shared: &Arc<Shared>, name: &str, data: &[u8]) {
    let _in_flight = InFlightGuard { shared, name };
    let path = shared.mount_path.join(name);

    let result = write_chunked(
        &path,
        data,
        shared.config.chunk_size,
        shared.config.write_rate(),
    );

    match result {
        Ok(()) => {
            let mut inner = shared.inner.lock();
            inner.dedup.insert(name.to_string());
            inner.root_file_count += 1;
            tracing::debug!(device = %shared.device, name, bytes = data.len(), "file written");
        }
        Err(e) => {
            tracing::warn!(device = %shared.device, name, "write failed: {}", e);
            // Leave nothing behind so a later retry starts clean
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(device = %shared.device, name, "failed to remove partial file: {}", e)
                }
            }
        }
    }
}

/// Write `data` to `path` in `chunk_size` pieces, sleeping `rate` after each
fn write_chunked(path: &Path, data: &[u8], chunk_size: usize, rate: Duration) -> Result<()> {
    let file = fsutil::open_or_create_full(path)?;
    file.set_len(0)?;

    let mut offset = 0u64;
    for chunk in data.chunks(chunk_size.max(1)) {
        file.write_all_at(chunk, offset)?;
        offset += chunk.len() as u64;
        if !rate.is_zero() {
            thread::sleep(rate);
        }
    }

    file.sync_all()?;
    Ok(())
}
