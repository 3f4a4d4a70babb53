//! Per-volume mutual exclusion.
//!
//! At most one stage/unstage operation may be in flight per volume id.
//! A second request for the same id is rejected immediately rather than
//! queued, so the orchestrator's own retry loop decides when to try again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{ConnectivityError, Result};

/// Set of volume ids with an operation in progress.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    in_flight: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Test-and-set: mark `volume_id` busy or fail with `VolumeAlreadyProcessing`.
    pub fn try_lock(&self, volume_id: &str) -> Result<()> {
        if !self.ids().insert(volume_id.to_string()) {
            warn!(volume_id = %volume_id, "Volume is already being processed");
            return Err(ConnectivityError::VolumeAlreadyProcessing(
                volume_id.to_string(),
            ));
        }
        debug!(volume_id = %volume_id, "Acquired volume lock");
        Ok(())
    }

    /// Remove `volume_id`; releasing an id that is not held is a no-op.
    pub fn release(&self, volume_id: &str) {
        if self.ids().remove(volume_id) {
            debug!(volume_id = %volume_id, "Released volume lock");
        }
    }

    pub fn is_locked(&self, volume_id: &str) -> bool {
        self.ids().contains(volume_id)
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }

    /// Lock `volume_id` for the lifetime of the returned guard.
    pub fn acquire(self: &Arc<Self>, volume_id: &str) -> Result<VolumeLockGuard> {
        self.try_lock(volume_id)?;
        Ok(VolumeLockGuard {
            locks: Arc::clone(self),
            volume_id: volume_id.to_string(),
        })
    }
}

/// Releases its volume id on drop, on every exit path.
#[derive(Debug)]
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    volume_id: String,
}

impl VolumeLockGuard {
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.volume_id);
    }
}
