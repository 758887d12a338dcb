//! Process-wide mutual-exclusion resources, passed around explicitly.
//!
//! One [`StorageSession`] is created by the front end and handed by
//! reference to every mount, setup and probe call. It serializes fstab
//! writes, keeps system-disk probes from overlapping, and remembers mount
//! points that were handed out but may not be populated yet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// State of a reserved mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Handed out, mount not finished yet.
    Pending,
    /// A mount succeeded there.
    Mounted,
}

#[derive(Debug, Default)]
pub struct StorageSession {
    fstab_lock: Mutex<()>,
    probe_lock: Mutex<()>,
    reserved_mount_points: Mutex<HashMap<PathBuf, Reservation>>,
}

impl StorageSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held for the whole backup + append sequence on the fstab.
    pub fn lock_fstab(&self) -> MutexGuard<'_, ()> {
        self.fstab_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Held for the whole mount/inspect/unmount sequence of a probe.
    pub fn lock_probe(&self) -> MutexGuard<'_, ()> {
        self.probe_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves `path` as pending. Returns false if it was already reserved.
    pub fn reserve_mount_point(&self, path: &Path) -> bool {
        let mut reserved = self.reserved();
        if reserved.contains_key(path) {
            return false;
        }
        reserved.insert(path.to_path_buf(), Reservation::Pending);
        true
    }

    /// Marks a reservation as backing a successful mount.
    pub fn confirm_mount_point(&self, path: &Path) {
        self.reserved()
            .insert(path.to_path_buf(), Reservation::Mounted);
    }

    /// Takes over a `Mounted` reservation whose mount has gone away, e.g.
    /// after an external `umount` or an unplug. `is_released` is called
    /// under the reservation lock. Pending reservations are never reclaimed.
    pub fn reclaim_mount_point(&self, path: &Path, is_released: impl FnOnce(&Path) -> bool) -> bool {
        let mut reserved = self.reserved();
        let Some(state) = reserved.get_mut(path) else {
            return false;
        };
        if *state != Reservation::Mounted || !is_released(path) {
            return false;
        }
        *state = Reservation::Pending;
        true
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved().contains_key(path)
    }

    pub fn reservation(&self, path: &Path) -> Option<Reservation> {
        self.reserved().get(path).copied()
    }

    /// Releases a reservation, e.g. after a failed mount.
    pub fn release_mount_point(&self, path: &Path) {
        self.reserved().remove(path);
    }

    fn reserved(&self) -> MutexGuard<'_, HashMap<PathBuf, Reservation>> {
        self.reserved_mount_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
