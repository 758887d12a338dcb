//! Fstab parsing and persistence.
//!
//! Entries are appended one line at a time. The file is backed up once,
//! before the first modification, to `<fstab>.backup`. Writes go through the
//! [`CommandRunner`] so they can be escalated.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Error;
use crate::error::{IoResultExt, Result};
use crate::executor::CommandRunner;
use crate::session::StorageSession;

/// Suffix of the one-time backup file.
pub const BACKUP_SUFFIX: &str = ".backup";

pub trait IntoMountOptions {
    fn into(self) -> Vec<String>;
}

impl IntoMountOptions for &str {
    fn into(self) -> Vec<String> {
        self.split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

impl IntoMountOptions for &String {
    fn into(self) -> Vec<String> {
        IntoMountOptions::into(self as &str)
    }
}

/// Represents a single fstab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// The device identifier (e.g., "UUID=xxx" or "/dev/sdb1").
    pub fs_spec: String,
    /// Mount point path.
    pub mount_point: PathBuf,
    /// Filesystem type (e.g., "ext4", "exfat").
    pub vfs_type: String,
    /// Mount options.
    pub mount_options: Vec<String>,
    /// Used by dump(8).
    pub dump: u8,
    /// Used by fsck(8) to order boot-time checks.
    pub fsck_order: u16,
}

impl FstabEntry {
    /// Creates a new fstab entry.
    pub fn new(
        fs_spec: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        fs_type: impl Into<String>,
        mount_options: impl IntoMountOptions,
        dump: u8,
        fsck_order: u16,
    ) -> Self {
        Self {
            fs_spec: fs_spec.into(),
            mount_point: mount_point.into(),
            vfs_type: fs_type.into(),
            mount_options: mount_options.into(),
            dump,
            fsck_order,
        }
    }

    /// Creates an entry for a data disk: dump 0, checked after root.
    pub fn data_disk(
        fs_spec: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        fs_type: impl Into<String>,
        mount_options: impl IntoMountOptions,
    ) -> Self {
        Self::new(fs_spec, mount_point, fs_type, mount_options, 0, 2)
    }

    /// Formats the entry as an fstab line.
    pub fn to_fstab_line(&self) -> String {
        let options = if self.mount_options.is_empty() {
            "defaults".to_string()
        } else {
            self.mount_options.join(",")
        };
        format!(
            "{} {} {} {} {} {}",
            self.fs_spec,
            escape_fstab_path(&self.mount_point.to_string_lossy()),
            self.vfs_type,
            options,
            self.dump,
            self.fsck_order
        )
    }

    /// Parses a single fstab line into an entry.
    ///
    /// Returns None for comments, empty lines and lines without six fields.
    pub fn from_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 6 {
            return Ok(None);
        }

        let dump = parts[4].parse::<u8>().map_err(|e| Error::FstabParse {
            message: format!("failed to parse dump field of line {}: {}", line, e),
        })?;
        let fsck_order = parts[5].parse::<u16>().map_err(|e| Error::FstabParse {
            message: format!("failed to parse fsck_order of line {}: {}", line, e),
        })?;

        Ok(Some(Self {
            fs_spec: parts[0].to_string(),
            mount_point: PathBuf::from(unescape_fstab_path(parts[1])),
            vfs_type: parts[2].to_string(),
            mount_options: IntoMountOptions::into(parts[3]),
            dump,
            fsck_order,
        }))
    }
}

/// Escapes special characters in fstab paths using octal sequences.
///
/// Handles space (\040), tab (\011), newline (\012), and backslash (\134).
fn escape_fstab_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            ' ' => encoded.push_str(r"\040"),
            '\t' => encoded.push_str(r"\011"),
            '\n' => encoded.push_str(r"\012"),
            '\\' => encoded.push_str(r"\134"),
            _ => encoded.push(c),
        }
    }
    encoded
}

/// Unescapes octal sequences in fstab paths.
fn unescape_fstab_path(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).take_while(|d| d.is_digit(8)).collect();
            if digits.len() == 3
                && let Ok(byte) = u8::from_str_radix(&digits, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

/// Reads every entry from the fstab at `path`.
///
/// A missing file has no entries. Malformed dump/pass fields are errors.
pub fn read_entries(path: &Path) -> Result<Vec<FstabEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).fstab_read_context(path),
    };

    let mut entries = Vec::new();
    for line in content.lines() {
        if let Some(entry) = FstabEntry::from_line(line)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Returns true if an entry with source `fs_spec` exists.
pub fn has_entry_for(path: &Path, fs_spec: &str) -> Result<bool> {
    Ok(read_entries(path)?.iter().any(|e| e.fs_spec == fs_spec))
}

/// Returns `<fstab>.backup`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Copies the fstab to its backup path unless a backup already exists.
///
/// Returns the backup path when a copy was made.
pub fn backup_once(runner: &dyn CommandRunner, path: &Path) -> Result<Option<PathBuf>> {
    let backup = backup_path(path);
    if backup.exists() {
        debug!(backup = %backup.display(), "fstab backup already present");
        return Ok(None);
    }
    if !path.exists() {
        return Ok(None);
    }

    runner.copy_file(path, &backup).backup_context(&backup)?;
    info!(backup = %backup.display(), "backed up fstab");
    Ok(Some(backup))
}

/// How a persistent mount treats an existing entry for the same source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Always append, even if the source is already listed.
    #[default]
    Append,
    /// Append only if no entry with the same source exists.
    IfAbsent,
}

/// Result of a persistence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOutcome {
    Appended,
    AlreadyPresent,
}

/// Backs up the fstab (once) and appends `entry`, holding the session's
/// fstab lock for the whole sequence.
///
/// Not transactional: a crash between backup and append leaves the backup
/// in place and the fstab unchanged.
pub fn persist_entry(
    runner: &dyn CommandRunner,
    session: &StorageSession,
    path: &Path,
    entry: &FstabEntry,
    mode: PersistMode,
) -> Result<PersistOutcome> {
    let _guard = session.lock_fstab();

    if mode == PersistMode::IfAbsent && has_entry_for(path, &entry.fs_spec)? {
        info!(source = %entry.fs_spec, "fstab entry already present");
        return Ok(PersistOutcome::AlreadyPresent);
    }

    backup_once(runner, path)?;

    let needs_newline = fs::read(path)
        .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
        .unwrap_or(false);
    let mut line = String::new();
    if needs_newline {
        line.push('\n');
    }
    line.push_str(&entry.to_fstab_line());
    line.push('\n');

    runner.append_file(path, &line).fstab_write_context(path)?;
    info!(source = %entry.fs_spec, mount_point = %entry.mount_point.display(), "appended fstab entry");
    Ok(PersistOutcome::Appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE_FSTAB: &str = r#"# /etc/fstab: static file system information.

# <file system>  <mount point>  <type>  <options>  <dump>  <pass>
UUID=abc-123  /  ext4  defaults  0  1
UUID=def-456  /boot/efi  vfat  umask=0077  0  1
UUID=custom  /mnt/custom  ext4  defaults  0  0
"#;

    #[test]
    fn test_parse_fstab_entry() {
        let line = "UUID=1234-5678  /mnt/usb-auto/Test  exfat  rw,noatime  0  2";
        let entry = FstabEntry::from_line(line).unwrap().unwrap();

        assert_eq!(entry.fs_spec, "UUID=1234-5678");
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/usb-auto/Test"));
        assert_eq!(entry.vfs_type, "exfat");
        assert_eq!(entry.mount_options, vec!["rw", "noatime"]);
        assert_eq!(entry.dump, 0);
        assert_eq!(entry.fsck_order, 2);
    }

    #[test]
    fn test_parse_fstab_skip_comments() {
        assert!(
            FstabEntry::from_line("# This is a comment")
                .unwrap()
                .is_none()
        );
        assert!(FstabEntry::from_line("").unwrap().is_none());
        assert!(FstabEntry::from_line("   ").unwrap().is_none());
        assert!(FstabEntry::from_line("UUID=x /mnt ext4").unwrap().is_none());
    }

    #[test]
    fn test_parse_fstab_bad_pass_field() {
        let err = FstabEntry::from_line("UUID=x /mnt ext4 defaults 0 z").unwrap_err();
        assert!(matches!(err, Error::FstabParse { .. }));
    }

    #[test]
    fn test_fstab_entry_to_line() {
        let entry = FstabEntry::data_disk(
            "UUID=test-123",
            "/mnt/usb-auto/BACKUP",
            "ext4",
            "rw,noatime,data=writeback",
        );
        assert_eq!(
            entry.to_fstab_line(),
            "UUID=test-123 /mnt/usb-auto/BACKUP ext4 rw,noatime,data=writeback 0 2"
        );
    }

    #[test]
    fn test_parse_fstab_escaped_spaces() {
        let line = "UUID=1234  /mnt/My\\040Drive  ntfs  defaults  0  0";
        let entry = FstabEntry::from_line(line).unwrap().unwrap();
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/My Drive"));

        let formatted = entry.to_fstab_line();
        assert!(formatted.contains("/mnt/My\\040Drive"));
        assert!(!formatted.contains("/mnt/My Drive"));
    }

    #[test]
    fn test_read_entries_and_lookup() {
        let mut fstab = NamedTempFile::new().unwrap();
        fstab.write_all(SAMPLE_FSTAB.as_bytes()).unwrap();

        let entries = read_entries(fstab.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(has_entry_for(fstab.path(), "UUID=custom").unwrap());
        assert!(!has_entry_for(fstab.path(), "UUID=missing").unwrap());

        let missing = fstab.path().with_extension("absent");
        assert!(read_entries(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_backup_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, SAMPLE_FSTAB).unwrap();
        let runner = ScriptedRunner::succeeding();

        let first = backup_once(&runner, &path).unwrap();
        assert_eq!(first, Some(dir.path().join("fstab.backup")));

        fs::write(&path, "changed\n").unwrap();
        assert_eq!(backup_once(&runner, &path).unwrap(), None);
        // The original content survives a second call.
        assert_eq!(
            fs::read_to_string(dir.path().join("fstab.backup")).unwrap(),
            SAMPLE_FSTAB
        );
    }

    #[test]
    fn test_persist_append_is_not_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, "UUID=abc-123 / ext4 defaults 0 1").unwrap();
        let runner = ScriptedRunner::succeeding();
        let session = StorageSession::new();
        let entry = FstabEntry::data_disk("UUID=1234", "/mnt/usb-auto/BACKUP", "ext4", "rw");

        for _ in 0..2 {
            let outcome =
                persist_entry(&runner, &session, &path, &entry, PersistMode::Append).unwrap();
            assert_eq!(outcome, PersistOutcome::Appended);
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "UUID=abc-123 / ext4 defaults 0 1\n\
             UUID=1234 /mnt/usb-auto/BACKUP ext4 rw 0 2\n\
             UUID=1234 /mnt/usb-auto/BACKUP ext4 rw 0 2\n"
        );
        assert!(backup_path(&path).exists());
    }

    #[test]
    fn test_persist_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, SAMPLE_FSTAB).unwrap();
        let runner = ScriptedRunner::succeeding();
        let session = StorageSession::new();
        let entry = FstabEntry::data_disk("UUID=custom", "/mnt/other", "ext4", "rw");

        let outcome =
            persist_entry(&runner, &session, &path, &entry, PersistMode::IfAbsent).unwrap();
        assert_eq!(outcome, PersistOutcome::AlreadyPresent);
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE_FSTAB);
        // Nothing changed, so no backup either.
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let original = "UUID=abc-123 / ext4 defaults 0 1\n";
        fs::write(&path, original).unwrap();
        let runner = ScriptedRunner::succeeding();
        let session = StorageSession::new();

        std::thread::scope(|s| {
            for i in 0..8 {
                let (runner, session, path) = (&runner, &session, &path);
                s.spawn(move || {
                    let entry = FstabEntry::data_disk(
                        format!("UUID=disk-{}", i),
                        format!("/mnt/usb-auto/DISK_{}", i),
                        "ext4",
                        "rw,noatime",
                    );
                    persist_entry(runner, session, path, &entry, PersistMode::Append).unwrap();
                });
            }
        });

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 9);
        let mut sources = HashSet::new();
        for line in &lines[1..] {
            let entry = FstabEntry::from_line(line).unwrap().unwrap();
            let id = entry.fs_spec.strip_prefix("UUID=disk-").unwrap().to_string();
            assert_eq!(
                entry.mount_point,
                PathBuf::from(format!("/mnt/usb-auto/DISK_{}", id))
            );
            assert_eq!(entry.mount_options, vec!["rw", "noatime"]);
            assert_eq!((entry.dump, entry.fsck_order), (0, 2));
            sources.insert(id);
        }
        assert_eq!(sources.len(), 8);

        assert_eq!(runner.calls_to("cp").len(), 1);
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), original);
    }
}
