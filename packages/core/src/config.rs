//! Runtime configuration for the storage core.
//!
//! Everything has a sensible default so the library works without a config
//! file. Front ends may load overrides from JSON with [`StorageConfig::load`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, Result};
use crate::executor::{PrivilegeEscalation, RunOptions};

/// Root directory under which devices are auto-mounted.
pub const DEFAULT_AUTO_MOUNT_ROOT: &str = "/mnt/usb-auto";

/// Directory holding convenience links to mounted devices.
pub const DEFAULT_LINKS_DIR: &str = "/srv/media";

/// Default fstab path.
pub const FSTAB_PATH: &str = "/etc/fstab";

/// Kernel table of active mounts.
pub const MOUNTS_TABLE_PATH: &str = "/proc/mounts";

/// Directory under which private scratch mount points are created.
pub const DEFAULT_SCRATCH_ROOT: &str = "/tmp";

/// Timeouts for external commands, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Block device listing and filesystem probing.
    pub discovery_secs: u64,
    /// SMART diagnostics.
    pub health_secs: u64,
    /// mount/umount.
    pub mount_secs: u64,
    /// Everything else (mkdir, chmod, chown, df, ln).
    pub default_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery_secs: 10,
            health_secs: 30,
            mount_secs: 30,
            default_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn discovery(&self) -> RunOptions {
        RunOptions::new(Duration::from_secs(self.discovery_secs))
    }

    pub fn health(&self) -> RunOptions {
        RunOptions::new(Duration::from_secs(self.health_secs))
    }

    pub fn mount(&self) -> RunOptions {
        RunOptions::new(Duration::from_secs(self.mount_secs))
    }

    pub fn short(&self) -> RunOptions {
        RunOptions::new(Duration::from_secs(self.default_secs))
    }
}

/// Configuration shared by discovery, mounting, setup and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub auto_mount_root: PathBuf,
    pub links_dir: PathBuf,
    pub fstab_path: PathBuf,
    /// Active mounts, in fstab format.
    pub mounts_table: PathBuf,
    pub scratch_root: PathBuf,
    /// Owner applied to ext-family mounts. Falls back to the invoking user.
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub escalation: PrivilegeEscalation,
    pub timeouts: Timeouts,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            auto_mount_root: PathBuf::from(DEFAULT_AUTO_MOUNT_ROOT),
            links_dir: PathBuf::from(DEFAULT_LINKS_DIR),
            fstab_path: PathBuf::from(FSTAB_PATH),
            mounts_table: PathBuf::from(MOUNTS_TABLE_PATH),
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_ROOT),
            owner_uid: None,
            owner_gid: None,
            escalation: PrivilegeEscalation::None,
            timeouts: Timeouts::default(),
        }
    }
}

impl StorageConfig {
    /// Creates a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        serde_json::from_str(&content).context(ConfigParseSnafu { path })
    }

    /// Loads the config at `path` if given, else the default location if it
    /// exists, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Sets the auto-mount root.
    pub fn with_auto_mount_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.auto_mount_root = path.into();
        self
    }

    /// Sets the media links directory.
    pub fn with_links_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.links_dir = path.into();
        self
    }

    /// Sets the fstab path.
    pub fn with_fstab_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab_path = path.into();
        self
    }

    /// Sets the table consulted for active mounts.
    pub fn with_mounts_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_table = path.into();
        self
    }

    /// Sets the scratch root used by the system-disk probe.
    pub fn with_scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_root = path.into();
        self
    }

    /// Sets the owner applied to ext-family mounts.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner_uid = Some(uid);
        self.owner_gid = Some(gid);
        self
    }

    /// Sets the privilege escalation method.
    pub fn with_escalation(mut self, escalation: PrivilegeEscalation) -> Self {
        self.escalation = escalation;
        self
    }
}

/// Returns `<config dir>/homestore/config.json`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("homestore").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.auto_mount_root, PathBuf::from("/mnt/usb-auto"));
        assert_eq!(config.fstab_path, PathBuf::from("/etc/fstab"));
        assert_eq!(config.mounts_table, PathBuf::from("/proc/mounts"));
        assert_eq!(config.timeouts.discovery_secs, 10);
        assert_eq!(config.timeouts.health_secs, 30);
        assert_eq!(
            config.timeouts.health().timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"auto_mount_root": "/media/auto", "escalation": "sudo", "timeouts": {"health_secs": 60}}"#,
        )
        .unwrap();

        let config = StorageConfig::load(file.path()).unwrap();
        assert_eq!(config.auto_mount_root, PathBuf::from("/media/auto"));
        assert_eq!(config.escalation, PrivilegeEscalation::Sudo);
        assert_eq!(config.timeouts.health_secs, 60);
        // Untouched keys keep defaults.
        assert_eq!(config.timeouts.discovery_secs, 10);
        assert_eq!(config.links_dir, PathBuf::from(DEFAULT_LINKS_DIR));
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = StorageConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigParse { .. }));
    }

    #[test]
    fn test_builder() {
        let config = StorageConfig::new()
            .with_fstab_path("/tmp/fstab")
            .with_owner(1001, 1002);
        assert_eq!(config.fstab_path, PathBuf::from("/tmp/fstab"));
        assert_eq!(config.owner_uid, Some(1001));
        assert_eq!(config.owner_gid, Some(1002));
    }
}
