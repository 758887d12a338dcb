//! Mount policy engine.
//!
//! Turns a device record into a mounted directory: picks a collision-free
//! mount point, derives filesystem-specific options, mounts, prepares media
//! folders on ext filesystems, and optionally persists the mount to fstab.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::whatever;
use tracing::{debug, info, warn};

use crate::config::{StorageConfig, Timeouts};
use crate::disk::{self, BlockDevice};
use crate::error::{Error, Result};
use crate::executor::CommandRunner;
use crate::fstab::{self, FstabEntry, PersistMode, PersistOutcome};
use crate::preset::{self, MountOptions};
use crate::probe::DeviceProbe;
use crate::session::StorageSession;

/// Folders created at the root of ext-family mounts.
pub const MEDIA_DIRECTORIES: [&str; 5] = ["Movies", "TV", "Music", "Books", "Downloads"];

/// A request to mount one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub device: PathBuf,
    /// Explicit mount point. Resolved under the auto-mount root when unset.
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub options: MountOptions,
    /// Append an fstab entry after mounting.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub persist_mode: PersistMode,
    /// Mount even if the device looks like a system disk.
    #[serde(default)]
    pub force: bool,
}

impl MountRequest {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            mount_point: None,
            options: MountOptions::default(),
            persistent: false,
            persist_mode: PersistMode::default(),
            force: false,
        }
    }

    pub fn with_mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    pub fn with_options(mut self, options: MountOptions) -> Self {
        self.options = options;
        self
    }

    pub fn persistent(mut self, mode: PersistMode) -> Self {
        self.persistent = true;
        self.persist_mode = mode;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Space usage of a mounted filesystem, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// What [`smart_mount`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountOutcome {
    pub device: BlockDevice,
    pub mount_point: PathBuf,
    /// Options passed to mount. None when the device was already mounted.
    pub options: Option<String>,
    pub already_mounted: bool,
    pub persisted: Option<PersistOutcome>,
    /// Set when the device mounted but its fstab entry could not be written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    pub usage: Option<DiskUsage>,
}

/// Detects devices, then mounts the one named by `request`.
pub fn smart_mount(
    runner: &dyn CommandRunner,
    probe: &dyn DeviceProbe,
    session: &StorageSession,
    config: &StorageConfig,
    request: &MountRequest,
) -> Result<MountOutcome> {
    let devices = disk::detect_devices(runner, probe, session, config)?;
    let device = disk::find_device(&devices, &request.device).ok_or_else(|| {
        Error::DeviceNotFound {
            device: request.device.display().to_string(),
        }
    })?;
    mount_device(runner, session, config, device, request)
}

/// Mounts a device from an existing discovery snapshot.
pub fn mount_device(
    runner: &dyn CommandRunner,
    session: &StorageSession,
    config: &StorageConfig,
    device: &BlockDevice,
    request: &MountRequest,
) -> Result<MountOutcome> {
    if let Some(mount_point) = &device.mount_point {
        info!(device = %device.device_path.display(), mount_point = %mount_point.display(), "already mounted");
        return Ok(MountOutcome {
            device: device.clone(),
            mount_point: mount_point.clone(),
            options: None,
            already_mounted: true,
            persisted: None,
            persist_error: None,
            usage: disk_usage(runner, &config.timeouts, mount_point).ok(),
        });
    }

    if device.is_system && !request.force {
        return Err(Error::SystemDevice {
            device: device.device_path.display().to_string(),
        });
    }

    let mount_point = match &request.mount_point {
        Some(explicit) => {
            session.reserve_mount_point(explicit);
            explicit.clone()
        }
        None => resolve_mount_point(session, config, device),
    };
    let options = request.options.build(&device.filesystem_type);

    if let Err(e) = run_mount(runner, &config.timeouts, device, &mount_point, &options) {
        session.release_mount_point(&mount_point);
        return Err(e);
    }
    session.confirm_mount_point(&mount_point);
    info!(device = %device.device_path.display(), mount_point = %mount_point.display(), options = %options, "mounted");

    let mut mounted = device.clone();
    mounted.is_mounted = true;
    mounted.mount_point = Some(mount_point.clone());

    if device.is_ext_family() {
        apply_permissions(runner, config, &mount_point);
    }

    let mut persisted = None;
    let mut persist_error = None;
    if request.persistent {
        let source = resolve_fstab_source(runner, &config.timeouts, device);
        let entry = FstabEntry::data_disk(
            source,
            &mount_point,
            device.filesystem_type.as_str(),
            &options,
        );
        // The mount stays in place; the caller gets the outcome plus the error.
        match fstab::persist_entry(
            runner,
            session,
            &config.fstab_path,
            &entry,
            request.persist_mode,
        ) {
            Ok(outcome) => persisted = Some(outcome),
            Err(e) => {
                warn!(device = %device.device_path.display(), error = %e, "mounted but failed to persist fstab entry");
                persist_error = Some(e.to_string());
            }
        }
    }

    let usage = match disk_usage(runner, &config.timeouts, &mount_point) {
        Ok(usage) => Some(usage),
        Err(e) => {
            debug!(mount_point = %mount_point.display(), error = %e, "disk usage unavailable");
            None
        }
    };

    Ok(MountOutcome {
        device: mounted,
        mount_point,
        options: Some(options),
        already_mounted: false,
        persisted,
        persist_error,
        usage,
    })
}

fn run_mount(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    device: &BlockDevice,
    mount_point: &Path,
    options: &str,
) -> Result<()> {
    let mount_point_arg = mount_point.to_string_lossy();
    runner
        .run("mkdir", &["-p", &mount_point_arg], timeouts.short().privileged())?
        .into_checked("mkdir")?;

    let device_arg = device.device_path.to_string_lossy();
    let mut args: Vec<&str> = Vec::new();
    if device.has_filesystem() {
        args.push("-t");
        args.push(&device.filesystem_type);
    }
    args.push("-o");
    args.push(options);
    args.push(&device_arg);
    args.push(&mount_point_arg);

    let output = runner.run("mount", &args, timeouts.mount().privileged())?;
    if !output.success {
        return Err(Error::Mount {
            device: device.device_path.display().to_string(),
            message: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// Picks a free mount point under the auto-mount root and reserves it in
/// the session.
///
/// The base name comes from [`BlockDevice::suggested_mount_name`]; `_1`,
/// `_2`, ... are appended while the candidate is a non-empty directory (or
/// any other existing file), a pending reservation, or a reservation whose
/// mount is still listed in the mounts table.
pub fn resolve_mount_point(session: &StorageSession, config: &StorageConfig, device: &BlockDevice) -> PathBuf {
    let base = device.suggested_mount_name();
    let mut suffix = 0u32;

    loop {
        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, suffix)
        };
        let candidate = config.auto_mount_root.join(name);
        if !is_occupied(&candidate) {
            if session.reserve_mount_point(&candidate) {
                return candidate;
            }
            if session.reclaim_mount_point(&candidate, |path| {
                !is_active_mount_point(&config.mounts_table, path)
            }) {
                debug!(mount_point = %candidate.display(), "reusing mount point released outside this session");
                return candidate;
            }
        }
        suffix += 1;
    }
}

/// Returns true if `path` appears in the mounts table. An unreadable table
/// counts as mounted.
fn is_active_mount_point(table: &Path, path: &Path) -> bool {
    match fstab::read_entries(table) {
        Ok(entries) => entries.iter().any(|entry| entry.mount_point == path),
        Err(e) => {
            warn!(table = %table.display(), error = %e, "cannot read mounts table");
            true
        }
    }
}

fn is_occupied(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => true,
    }
}

/// Returns the fstab source: the UUID reported by blkid, else the record's
/// UUID, else the device path.
fn resolve_fstab_source(runner: &dyn CommandRunner, timeouts: &Timeouts, device: &BlockDevice) -> String {
    let device_arg = device.device_path.to_string_lossy();
    let output = runner.run(
        "blkid",
        &["-s", "UUID", "-o", "value", &device_arg],
        timeouts.short().privileged(),
    );
    match output {
        Ok(output) if output.success && !output.stdout.trim().is_empty() => {
            format!("UUID={}", output.stdout.trim())
        }
        _ => device.fstab_spec(),
    }
}

/// Returns the uid/gid that should own media folders.
///
/// Config override first, then the user that invoked sudo, then this process.
pub fn resolve_owner(config: &StorageConfig) -> (u32, u32) {
    pick_owner(
        config,
        std::env::var("SUDO_UID").ok().as_deref(),
        std::env::var("SUDO_GID").ok().as_deref(),
    )
}

fn pick_owner(config: &StorageConfig, sudo_uid: Option<&str>, sudo_gid: Option<&str>) -> (u32, u32) {
    let uid = config
        .owner_uid
        .or_else(|| sudo_uid.and_then(|v| v.trim().parse().ok()))
        .unwrap_or_else(preset::current_uid);
    let gid = config
        .owner_gid
        .or_else(|| sudo_gid.and_then(|v| v.trim().parse().ok()))
        .unwrap_or_else(preset::current_gid);
    (uid, gid)
}

/// Creates the media folders and hands the mount over to the invoking user.
///
/// Best-effort: failures are logged and skipped.
pub fn apply_permissions(runner: &dyn CommandRunner, config: &StorageConfig, mount_point: &Path) {
    let options = config.timeouts.short().privileged();

    for dir in MEDIA_DIRECTORIES {
        let path = mount_point.join(dir);
        let path_arg = path.to_string_lossy();
        let steps: [(&str, [&str; 2]); 2] =
            [("mkdir", ["-p", &path_arg]), ("chmod", ["755", &path_arg])];
        for (program, args) in steps {
            if let Err(e) = runner
                .run(program, &args, options)
                .and_then(|o| o.into_checked(program))
            {
                warn!(path = %path.display(), error = %e, "failed to prepare media folder");
            }
        }
    }

    let (uid, gid) = resolve_owner(config);
    let owner = format!("{}:{}", uid, gid);
    let mount_point_arg = mount_point.to_string_lossy();
    if let Err(e) = runner
        .run("chown", &["-R", &owner, &mount_point_arg], options)
        .and_then(|o| o.into_checked("chown"))
    {
        warn!(mount_point = %mount_point.display(), owner = %owner, error = %e, "failed to change ownership");
    }
}

/// Reports size/used/available bytes for the filesystem at `path`.
pub fn disk_usage(runner: &dyn CommandRunner, timeouts: &Timeouts, path: &Path) -> Result<DiskUsage> {
    let path_arg = path.to_string_lossy();
    let output = runner
        .run(
            "df",
            &["-B1", "--output=size,used,avail", &path_arg],
            timeouts.short(),
        )?
        .into_checked("df")?;

    let numbers: Vec<u64> = output
        .stdout
        .lines()
        .nth(1)
        .map(|line| line.split_whitespace().filter_map(|v| v.parse().ok()).collect())
        .unwrap_or_default();

    match numbers.as_slice() {
        [total, used, available] => Ok(DiskUsage {
            total_bytes: *total,
            used_bytes: *used,
            available_bytes: *available,
        }),
        _ => whatever!("unexpected df output: {}", output.stdout.trim()),
    }
}

/// Unmounts `mount_point`. The fstab is never touched.
pub fn unmount(
    runner: &dyn CommandRunner,
    session: &StorageSession,
    config: &StorageConfig,
    mount_point: &Path,
) -> Result<()> {
    let mount_point_arg = mount_point.to_string_lossy();
    let output = runner.run(
        "umount",
        &[&mount_point_arg],
        config.timeouts.mount().privileged(),
    )?;

    if !output.success {
        return Err(Error::Unmount {
            path: mount_point.to_path_buf(),
            message: output.stderr.trim().to_string(),
        });
    }

    session.release_mount_point(mount_point);
    info!(mount_point = %mount_point.display(), "unmounted");
    Ok(())
}
