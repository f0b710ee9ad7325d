//! Reconciliation loop
//!
//! Every `reconcile_interval_ms` the manager:
//! 1. Tears down volumes that failed their validity check and frees their
//!    mount points
//! 2. Attaches newly plugged devices to free mount points
//! 3. Publishes a status snapshot
//!
//! A failing or panicking pass is logged and the loop carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::Result;
use crate::volume::Volume;

use super::{release_mount, Manager};

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Invalid volumes torn down
    pub removed: usize,

    /// Devices newly attached
    pub attached: usize,

    /// Volumes active after the pass
    pub active: usize,

    /// Whether the status snapshot was saved
    pub status_saved: bool,
}

/// Handle to the background reconciliation thread
pub struct Reconciler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Wake the loop, make it exit, and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Block until the loop exits on its own (it only does once the manager
    /// is shut down)
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("reconciliation thread panicked");
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("reconciliation thread panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Manager {
    /// Spawn the reconciliation loop on its own thread
    pub fn start_reconciler(self: &Arc<Self>) -> Result<Reconciler> {
        let (stop, stopped) = channel::bounded(1);
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("usbdb-reconciler".to_string())
            .spawn(move || manager.reconcile_loop(stopped))?;

        Ok(Reconciler {
            stop,
            handle: Some(handle),
        })
    }

    /// Run one reconciliation pass now
    pub fn reconcile_once(&self) -> Result<ReconcileReport> {
        if self.is_closed() {
            return Ok(ReconcileReport::default());
        }

        // Step 1: Tear down invalid volumes; draining happens without the lock
        let invalid: Vec<Arc<Volume>> = {
            let state = self.state.lock();
            state
                .volumes
                .iter()
                .filter(|v| !v.is_valid())
                .cloned()
                .collect()
        };

        for volume in &invalid {
            volume.uninit();
        }

        let attached = {
            let mut state = self.state.lock();
            for volume in &invalid {
                state.volumes.retain(|v| !Arc::ptr_eq(v, volume));
                release_mount(&mut state.free_mounts, volume.mount_path().to_path_buf());
                tracing::info!(
                    device = volume.device(),
                    mount_path = %volume.mount_path().display(),
                    "released mount point"
                );
            }

            // Step 2: Attach new devices
            if self.is_closed() {
                0
            } else {
                self.attach_devices(&mut state)
            }
        };

        // Step 3: Publish status
        let status_saved = self.publish_status();

        Ok(ReconcileReport {
            removed: invalid.len(),
            attached,
            active: self.active_volume_count(),
            status_saved,
        })
    }

    /// Rewrite the status snapshot from the current volume set
    pub fn publish_status(&self) -> bool {
        let rows: Vec<(String, String, usize, u8)> = self
            .state
            .lock()
            .volumes
            .iter()
            .map(|v| {
                (
                    v.device().to_string(),
                    v.mount_path().display().to_string(),
                    v.total_files(),
                    v.free_percent(),
                )
            })
            .collect();

        let mut status = self.status.lock();
        status.clear();
        for (i, (device, path, files, free)) in rows.iter().enumerate() {
            let n = i + 1;
            status.set(&format!("USBName_{}", n), device);
            status.set(&format!("USBPath_{}", n), path);
            status.set(&format!("TotalFiles_{}", n), &files.to_string());
            status.set(&format!("USBStorage_{}", n), &free.to_string());
        }

        let saved = status.save();
        if !saved {
            tracing::warn!("failed to publish status snapshot");
        }
        saved
    }

    fn reconcile_loop(&self, stopped: Receiver<()>) {
        let interval = self.config.reconcile_interval();
        tracing::info!(interval_ms = self.config.reconcile_interval_ms, "reconciliation loop started");

        loop {
            if self.is_closed() {
                break;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.reconcile_once())) {
                Ok(Ok(report)) => {
                    tracing::debug!(
                        removed = report.removed,
                        attached = report.attached,
                        active = report.active,
                        "reconciliation pass complete"
                    );
                }
                Ok(Err(e)) => tracing::error!("reconciliation pass failed: {}", e),
                Err(_) => tracing::error!("reconciliation pass panicked"),
            }

            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("reconciliation loop stopped");
    }
}
