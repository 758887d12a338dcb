//! System-disk heuristic.
//!
//! A candidate is considered the host's own system disk when its filesystem
//! contains `boot`, `etc` or `usr` at the top level. Checking that requires
//! a real (read-only) mount, so the mount/unmount pair sits behind the
//! [`DeviceProbe`] capability and is wrapped in a [`ScratchMount`] guard that
//! releases the mount on every exit path.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::config::Timeouts;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{CommandRunner, RunOptions};
use crate::session::StorageSession;

/// Top-level directories that identify a root filesystem.
pub const SYSTEM_MARKERS: [&str; 3] = ["boot", "etc", "usr"];

/// Mount capability used by the system-disk heuristic.
pub trait DeviceProbe: Send + Sync {
    /// Mounts `device` read-only at `target`.
    fn mount_readonly(&self, device: &Path, target: &Path) -> Result<()>;

    /// Unmounts whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Returns true if `root/marker` is a directory.
    fn has_marker(&self, root: &Path, marker: &str) -> bool {
        root.join(marker).is_dir()
    }
}

/// Probe backed by the real `mount`/`umount` tools.
pub struct SystemProbe<'a> {
    runner: &'a dyn CommandRunner,
    options: RunOptions,
}

impl<'a> SystemProbe<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeouts: &Timeouts) -> Self {
        Self {
            runner,
            options: timeouts.mount().privileged(),
        }
    }
}

impl DeviceProbe for SystemProbe<'_> {
    fn mount_readonly(&self, device: &Path, target: &Path) -> Result<()> {
        let device_arg = device.to_string_lossy();
        let target_arg = target.to_string_lossy();
        let output = self
            .runner
            .run("mount", &["-o", "ro", &device_arg, &target_arg], self.options)?;

        if !output.success {
            return Err(Error::Mount {
                device: device.display().to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let target_arg = target.to_string_lossy();
        let output = self.runner.run("umount", &[&target_arg], self.options)?;

        if !output.success {
            return Err(Error::Unmount {
                path: target.to_path_buf(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// A device mounted at a private scratch directory.
///
/// Dropping the guard unmounts the device and then removes the directory.
/// If the unmount fails the directory is kept, so nothing ever recurses into
/// a live filesystem.
pub struct ScratchMount<'a> {
    probe: &'a dyn DeviceProbe,
    root: PathBuf,
    dir: Option<TempDir>,
}

impl<'a> ScratchMount<'a> {
    /// Mounts `device` inside a fresh directory under `scratch_root`.
    pub fn mount(probe: &'a dyn DeviceProbe, device: &Path, scratch_root: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("homestore-probe-")
            .tempdir_in(scratch_root)
            .mount_point_context(scratch_root)?;

        probe.mount_readonly(device, dir.path())?;
        Ok(Self {
            probe,
            root: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for ScratchMount<'_> {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if let Err(e) = self.probe.unmount(&self.root) {
            // A leaked scratch mount keeps the device busy; make it loud.
            error!(path = %self.root.display(), error = %e, "failed to release scratch mount, leaving directory in place");
            let _ = dir.keep();
        }
    }
}

/// Returns true if any system marker exists under `root`.
pub fn has_system_markers(probe: &dyn DeviceProbe, root: &Path) -> bool {
    SYSTEM_MARKERS
        .iter()
        .any(|marker| probe.has_marker(root, marker))
}

/// Decides whether `device` is the host's own system disk.
///
/// Mount failures mean "cannot confirm" and yield false.
pub fn is_system_device(
    probe: &dyn DeviceProbe,
    session: &StorageSession,
    scratch_root: &Path,
    device: &Path,
) -> bool {
    let _guard = session.lock_probe();

    let mount = match ScratchMount::mount(probe, device, scratch_root) {
        Ok(mount) => mount,
        Err(e) => {
            debug!(device = %device.display(), error = %e, "probe mount failed, assuming not a system disk");
            return false;
        }
    };

    let is_system = has_system_markers(probe, mount.root());
    if is_system {
        warn!(device = %device.display(), "device looks like a system disk");
    }
    is_system
}
