//! Mount option policy.
//!
//! Options are derived from the filesystem type:
//! - ext2/3/4 get writeback journaling tuned for large media files
//! - FAT, NTFS and exFAT get UTF-8 names and world-writable permissions
//!
//! Caller overrides are applied on top of the table.

use serde::{Deserialize, Serialize};

/// Options applied to every mount.
pub const BASE_OPTIONS: [&str; 2] = ["rw", "noatime"];

/// Journal commit interval used when optimizing ext filesystems for media.
pub const MEDIA_COMMIT_SECS: u32 = 60;

/// Returns the current user's UID.
pub fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// Returns the current user's primary GID.
pub fn current_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

/// Filesystem families with their own option rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemFamily {
    Ext,
    Fat,
    Ntfs,
    Exfat,
    Other,
}

impl From<&str> for FilesystemFamily {
    fn from(fstype: &str) -> Self {
        match fstype.to_lowercase().as_str() {
            "ext2" | "ext3" | "ext4" => Self::Ext,
            "vfat" | "fat" | "fat16" | "fat32" => Self::Fat,
            "ntfs" | "ntfs3" => Self::Ntfs,
            "exfat" => Self::Exfat,
            _ => Self::Other,
        }
    }
}

/// Caller-controlled mount option overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub read_only: bool,
    pub no_exec: bool,
    /// Adds a long journal commit interval on ext filesystems.
    pub optimize_for_media: bool,
    /// Appended verbatim after everything else.
    pub extra_options: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            no_exec: false,
            optimize_for_media: true,
            extra_options: Vec::new(),
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn no_exec(mut self) -> Self {
        self.no_exec = true;
        self
    }

    pub fn without_media_optimization(mut self) -> Self {
        self.optimize_for_media = false;
        self
    }

    pub fn with_extra(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    /// Builds the comma-separated option string for `fstype`.
    pub fn build(&self, fstype: &str) -> String {
        let mut opts: Vec<String> = BASE_OPTIONS.iter().map(|s| s.to_string()).collect();

        match FilesystemFamily::from(fstype) {
            FilesystemFamily::Ext => {
                opts.push("data=writeback".to_string());
                opts.push("nobarrier".to_string());
                if self.optimize_for_media {
                    opts.push(format!("commit={}", MEDIA_COMMIT_SECS));
                }
            }
            FilesystemFamily::Fat | FilesystemFamily::Exfat => {
                opts.push("utf8".to_string());
                opts.push("umask=000".to_string());
            }
            FilesystemFamily::Ntfs => {
                opts.push("utf8".to_string());
                opts.push("umask=000".to_string());
                opts.push("nls=utf8".to_string());
            }
            FilesystemFamily::Other => {}
        }

        if self.read_only {
            opts.retain(|o| o != "rw");
            opts.push("ro".to_string());
        }
        if self.no_exec {
            opts.push("noexec".to_string());
        }
        opts.extend(self.extra_options.iter().filter(|o| !o.is_empty()).cloned());

        opts.join(",")
    }
}
