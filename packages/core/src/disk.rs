//! Removable block device discovery using lsblk.
//!
//! Walks the lsblk device tree, keeps hot-pluggable disks and partitions,
//! fills in filesystem metadata from blkid where lsblk left it out, and flags
//! devices that look like the host's own system disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{StorageConfig, Timeouts};
use crate::error::{Error, Result};
use crate::executor::CommandRunner;
use crate::probe::{self, DeviceProbe};
use crate::session::StorageSession;

/// Name fragments that are never offered: loop devices, ramdisks, optical
/// drives and the SD card the host boots from.
pub const IGNORED_NAME_FRAGMENTS: [&str; 4] = ["loop", "ram", "sr", "mmcblk0"];

/// Filesystem type reported when nothing could be detected.
pub const UNKNOWN_FILESYSTEM: &str = "unknown";

const LSBLK_COLUMNS: &str = "NAME,KNAME,SIZE,FSTYPE,LABEL,UUID,MOUNTPOINT,MODEL,VENDOR,TYPE,HOTPLUG";

/// Whether a record is a whole disk or one of its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
}

/// A removable disk or partition as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Full device path (e.g., "/dev/sdb1").
    pub device_path: PathBuf,
    /// Kernel node name (e.g., "sdb1").
    pub name: String,
    /// Volume label, empty if unset.
    pub label: String,
    /// Filesystem UUID, empty if unknown.
    pub uuid: String,
    /// Filesystem type, or "unknown".
    pub filesystem_type: String,
    pub size_bytes: u64,
    pub model: String,
    pub vendor: String,
    pub device_type: DeviceKind,
    pub is_mounted: bool,
    /// Current mount point, if mounted.
    pub mount_point: Option<PathBuf>,
    /// Heuristically identified as the host's own system disk.
    pub is_system: bool,
}

impl BlockDevice {
    /// Returns the fstab source for this device: `UUID=...` when the UUID is
    /// known, else the device path.
    pub fn fstab_spec(&self) -> String {
        if self.uuid.is_empty() {
            self.device_path.display().to_string()
        } else {
            format!("UUID={}", self.uuid)
        }
    }

    /// Returns a mount point directory name for this device.
    ///
    /// Prefers the sanitized label, then the first 8 characters of the UUID,
    /// then the device node name.
    pub fn suggested_mount_name(&self) -> String {
        if !self.label.is_empty() {
            return sanitize_mount_name(&self.label);
        }
        if !self.uuid.is_empty() {
            return self.uuid.chars().take(8).collect();
        }
        self.name.clone()
    }

    /// Returns the name used for this device's media link.
    pub fn link_name(&self) -> String {
        if self.label.is_empty() {
            self.name.clone()
        } else {
            sanitize_mount_name(&self.label)
        }
    }

    /// Returns true for ext2/ext3/ext4.
    pub fn is_ext_family(&self) -> bool {
        matches!(self.filesystem_type.as_str(), "ext2" | "ext3" | "ext4")
    }

    /// Returns true if a filesystem was detected.
    pub fn has_filesystem(&self) -> bool {
        !self.filesystem_type.is_empty() && self.filesystem_type != UNKNOWN_FILESYSTEM
    }
}

/// Replaces every non-alphanumeric character with `_`.
pub fn sanitize_mount_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Parses a human-readable size such as "32G", "1.5T" or "512".
///
/// Suffixes B/K/M/G/T are base 1024; a trailing "iB" or "B" is tolerated.
/// Anything unparsable yields 0.
pub fn parse_size(input: &str) -> u64 {
    let normalized = input.trim().replace(',', ".").to_ascii_uppercase();
    if normalized.is_empty() {
        return 0;
    }
    if let Ok(bytes) = normalized.parse::<u64>() {
        return bytes;
    }

    let stripped = normalized.strip_suffix("IB").unwrap_or(&normalized);
    let stripped = stripped.strip_suffix('B').unwrap_or(stripped);

    let (number, multiplier) = match stripped.chars().last() {
        Some('K') => (&stripped[..stripped.len() - 1], 1u64 << 10),
        Some('M') => (&stripped[..stripped.len() - 1], 1u64 << 20),
        Some('G') => (&stripped[..stripped.len() - 1], 1u64 << 30),
        Some('T') => (&stripped[..stripped.len() - 1], 1u64 << 40),
        _ => (stripped, 1),
    };

    match number.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => (value * multiplier as f64) as u64,
        _ => 0,
    }
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    kname: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    size: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    fstype: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    label: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    uuid: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    mountpoint: Option<String>,
    /// lsblk >= 2.37 may report every mount point of a device.
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default, deserialize_with = "lenient_string")]
    model: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    vendor: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    device_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    hotplug: bool,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn kind(&self) -> Option<DeviceKind> {
        match self.device_type.as_deref() {
            Some("disk") => Some(DeviceKind::Disk),
            Some("part") | Some("partition") => Some(DeviceKind::Partition),
            _ => None,
        }
    }

    fn current_mount_point(&self) -> Option<PathBuf> {
        self.mountpoint
            .clone()
            .or_else(|| self.mountpoints.iter().flatten().next().cloned())
            .filter(|m| !m.is_empty())
            .map(PathBuf::from)
    }
}

/// Accepts strings, numbers and booleans, trimming strings; empty becomes None.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// lsblk reports flags as `true`, `"1"` or `1` depending on its version.
fn lenient_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

/// Returns true if `name` contains an ignored fragment.
pub fn is_ignored_name(name: &str) -> bool {
    IGNORED_NAME_FRAGMENTS
        .iter()
        .any(|fragment| name.contains(fragment))
}

fn is_candidate(dev: &LsblkDevice) -> bool {
    dev.hotplug && dev.kind().is_some() && !is_ignored_name(&dev.name)
}

/// Parses lsblk JSON into candidate records (no enrichment, no system check).
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut devices = Vec::new();
    collect_candidates(&output.blockdevices, &mut devices);
    Ok(devices)
}

/// Depth-first walk. Children are visited whether or not their parent was
/// accepted: a raw whole disk can still carry usable partitions.
fn collect_candidates(nodes: &[LsblkDevice], devices: &mut Vec<BlockDevice>) {
    for dev in nodes {
        if let Some(kind) = dev.kind().filter(|_| is_candidate(dev)) {
            let node_name = dev.kname.clone().unwrap_or_else(|| dev.name.clone());
            let mount_point = dev.current_mount_point();
            devices.push(BlockDevice {
                device_path: PathBuf::from(format!("/dev/{}", node_name)),
                name: node_name,
                label: dev.label.clone().unwrap_or_default(),
                uuid: dev.uuid.clone().unwrap_or_default(),
                filesystem_type: dev.fstype.clone().unwrap_or_default(),
                size_bytes: dev.size.as_deref().map(parse_size).unwrap_or(0),
                model: dev.model.clone().unwrap_or_default(),
                vendor: dev.vendor.clone().unwrap_or_default(),
                device_type: kind,
                is_mounted: mount_point.is_some(),
                mount_point,
                is_system: false,
            });
        }

        collect_candidates(&dev.children, devices);
    }
}

/// Parses `KEY="VALUE"` pairs as printed by `blkid <device>`.
pub fn parse_blkid_pairs(output: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut rest = output;

    while let Some(eq) = rest.find("=\"") {
        let key_start = rest[..eq]
            .rfind(|c: char| c.is_whitespace() || c == ':')
            .map_or(0, |i| i + 1);
        let key = &rest[key_start..eq];
        let value_start = eq + 2;
        let Some(len) = rest[value_start..].find('"') else {
            break;
        };
        if !key.is_empty() {
            pairs.insert(key.to_string(), rest[value_start..value_start + len].to_string());
        }
        rest = &rest[value_start + len + 1..];
    }

    pairs
}

/// Fills empty label/UUID/type fields from blkid. Failures leave them empty.
fn enrich_from_blkid(runner: &dyn CommandRunner, timeouts: &Timeouts, device: &mut BlockDevice) {
    if !device.label.is_empty() && !device.uuid.is_empty() && !device.filesystem_type.is_empty() {
        return;
    }

    let path = device.device_path.to_string_lossy();
    let pairs = match runner.run("blkid", &[&path], timeouts.discovery().privileged()) {
        Ok(output) if output.success => parse_blkid_pairs(&output.stdout),
        Ok(output) => {
            debug!(device = %path, exit_code = output.exit_code, "blkid found nothing");
            return;
        }
        Err(e) => {
            debug!(device = %path, error = %e, "blkid failed");
            return;
        }
    };

    let fill = |field: &mut String, key: &str| {
        if field.is_empty()
            && let Some(value) = pairs.get(key)
        {
            *field = value.clone();
        }
    };
    fill(&mut device.label, "LABEL");
    fill(&mut device.uuid, "UUID");
    fill(&mut device.filesystem_type, "TYPE");
}

/// Lists removable disks and partitions.
///
/// Every call re-probes live state; nothing is cached between calls.
pub fn detect_devices(
    runner: &dyn CommandRunner,
    probe: &dyn DeviceProbe,
    session: &StorageSession,
    config: &StorageConfig,
) -> Result<Vec<BlockDevice>> {
    let output = runner
        .run(
            "lsblk",
            &["--json", "--output", LSBLK_COLUMNS],
            config.timeouts.discovery(),
        )?
        .into_checked("lsblk")?;

    let mut devices = parse_lsblk(&output.stdout)?;

    for device in &mut devices {
        enrich_from_blkid(runner, &config.timeouts, device);
        if device.filesystem_type.is_empty() {
            device.filesystem_type = UNKNOWN_FILESYSTEM.to_string();
        }
        device.is_system = check_system(probe, session, &config.scratch_root, device);
    }

    info!(count = devices.len(), "detected removable devices");
    Ok(devices)
}

fn check_system(
    probe: &dyn DeviceProbe,
    session: &StorageSession,
    scratch_root: &Path,
    device: &BlockDevice,
) -> bool {
    if !device.has_filesystem() {
        return false;
    }
    match &device.mount_point {
        // Already mounted: inspect in place instead of mounting twice.
        Some(mount_point) => probe::has_system_markers(probe, mount_point),
        None => probe::is_system_device(probe, session, scratch_root, &device.device_path),
    }
}

/// Finds a device by path in a snapshot.
pub fn find_device<'a>(devices: &'a [BlockDevice], path: &Path) -> Option<&'a BlockDevice> {
    devices.iter().find(|d| d.device_path == path)
}

/// Lists whole-disk device paths (no partitions), removable or not.
pub fn list_disks(runner: &dyn CommandRunner, timeouts: &Timeouts) -> Result<Vec<PathBuf>> {
    #[derive(Deserialize)]
    struct Disks {
        #[serde(default)]
        blockdevices: Vec<DiskNode>,
    }

    #[derive(Deserialize)]
    struct DiskNode {
        name: String,
        #[serde(rename = "type", default)]
        device_type: Option<String>,
    }

    let output = runner
        .run(
            "lsblk",
            &["--json", "--nodeps", "--output", "NAME,TYPE"],
            timeouts.discovery(),
        )?
        .into_checked("lsblk")?;

    let disks: Disks = serde_json::from_str(&output.stdout).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    Ok(disks
        .blockdevices
        .into_iter()
        .filter(|d| d.device_type.as_deref() == Some("disk"))
        .map(|d| PathBuf::from(format!("/dev/{}", d.name)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, ScriptedRunner, failed, ok};

    const SAMPLE_LSBLK_JSON: &str = r#"{
        "blockdevices": [
            {
                "name": "mmcblk0", "kname": "mmcblk0", "size": "29.7G", "fstype": null,
                "label": null, "uuid": null, "mountpoint": null, "model": null,
                "vendor": null, "type": "disk", "hotplug": true,
                "children": [
                    {
                        "name": "mmcblk0p2", "kname": "mmcblk0p2", "size": "29.5G",
                        "fstype": "ext4", "label": "rootfs", "uuid": "aaaa-bbbb",
                        "mountpoint": "/", "model": null, "vendor": null,
                        "type": "part", "hotplug": true
                    }
                ]
            },
            {
                "name": "sda", "kname": "sda", "size": "465.8G", "fstype": null,
                "label": null, "uuid": null, "mountpoint": null, "model": "Internal SSD",
                "vendor": "ATA     ", "type": "disk", "hotplug": false,
                "children": [
                    {
                        "name": "sda1", "kname": "sda1", "size": "465.8G", "fstype": "ext4",
                        "label": "data", "uuid": "cccc", "mountpoint": "/data",
                        "model": null, "vendor": null, "type": "part", "hotplug": false
                    }
                ]
            },
            {
                "name": "sdb", "kname": "sdb", "size": "1.8T", "fstype": null,
                "label": null, "uuid": null, "mountpoint": null, "model": "Expansion HDD",
                "vendor": "Seagate ", "type": "disk", "hotplug": "1",
                "children": [
                    {
                        "name": "sdb1", "kname": "sdb1", "size": "1.8T", "fstype": "ntfs",
                        "label": "Movies & TV", "uuid": "0123456789ABCDEF",
                        "mountpoint": "/mnt/usb-auto/Movies___TV", "model": null,
                        "vendor": null, "type": "part", "hotplug": "1"
                    }
                ]
            },
            {
                "name": "sr0", "kname": "sr0", "size": "1024M", "fstype": null,
                "label": null, "uuid": null, "mountpoint": null, "model": "DVD-RW",
                "vendor": null, "type": "rom", "hotplug": true
            },
            {
                "name": "loop0", "kname": "loop0", "size": "64M", "fstype": "squashfs",
                "label": null, "uuid": null, "mountpoint": "/snap/core", "model": null,
                "vendor": null, "type": "loop", "hotplug": false
            }
        ]
    }"#;

    const SINGLE_DISK_JSON: &str = r#"{
        "blockdevices": [
            {
                "name": "sdb", "kname": "sdb", "size": "32G", "fstype": "ext4",
                "label": "BACKUP", "uuid": "1234-5678-ABCD", "mountpoint": null,
                "model": "Flash Drive", "vendor": "SanDisk", "type": "disk",
                "hotplug": true
            }
        ]
    }"#;

    #[test]
    fn test_parse_lsblk_filters_candidates() {
        let devices = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();

        // Fixed disks, the SD card, optical and loop devices are dropped.
        assert_eq!(names, vec!["sdb", "sdb1"]);

        let part = &devices[1];
        assert_eq!(part.device_path, PathBuf::from("/dev/sdb1"));
        assert_eq!(part.device_type, DeviceKind::Partition);
        assert_eq!(part.label, "Movies & TV");
        assert_eq!(part.filesystem_type, "ntfs");
        assert!(part.is_mounted);
        assert_eq!(
            part.mount_point,
            Some(PathBuf::from("/mnt/usb-auto/Movies___TV"))
        );
        assert_eq!(devices[0].vendor, "Seagate");
    }

    #[test]
    fn test_ignored_fragments_never_listed() {
        for fragment in IGNORED_NAME_FRAGMENTS {
            let json = format!(
                r#"{{"blockdevices": [{{"name": "x{0}1", "size": "8G", "type": "disk", "hotplug": true,
                    "children": [{{"name": "x{0}1p1", "size": "8G", "type": "part", "hotplug": true}}]}}]}}"#,
                fragment
            );
            let devices = parse_lsblk(&json).unwrap();
            assert!(devices.is_empty(), "fragment {} leaked: {:?}", fragment, devices);
        }
    }

    #[test]
    fn test_non_hotplug_or_wrong_type_excluded() {
        let json = r#"{"blockdevices": [
            {"name": "sdc", "size": "8G", "type": "disk", "hotplug": false, "label": "X"},
            {"name": "sdd", "size": "8G", "type": "crypt", "hotplug": true},
            {"name": "sde", "size": "8G", "type": "lvm", "hotplug": 1},
            {"name": "sdf", "size": "8G", "type": "disk", "hotplug": 1}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdf");
    }

    #[test]
    fn test_children_visited_under_rejected_parent() {
        let json = r#"{"blockdevices": [
            {"name": "sdg", "size": "8G", "type": "disk", "hotplug": false, "children": [
                {"name": "sdg1", "size": "8G", "type": "part", "hotplug": true, "fstype": "vfat"}
            ]}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdg1");
    }

    #[test]
    fn test_mountpoints_array() {
        let json = r#"{"blockdevices": [
            {"name": "sdh1", "size": "8G", "type": "part", "hotplug": true,
             "mountpoints": [null, "/mnt/usb-auto/STICK"]}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(
            devices[0].mount_point,
            Some(PathBuf::from("/mnt/usb-auto/STICK"))
        );
    }

    #[test]
    fn test_parse_lsblk_rejects_garbage() {
        assert!(matches!(
            parse_lsblk("not json"),
            Err(Error::LsblkParse { .. })
        ));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("32G"), 32 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512"), 512);
        assert_eq!(parse_size("512B"), 512);
        assert_eq!(parse_size("4K"), 4096);
        assert_eq!(parse_size("1.5M"), 1_572_864);
        assert_eq!(parse_size("1,5M"), 1_572_864);
        assert_eq!(parse_size("2T"), 2 * (1u64 << 40));
        assert_eq!(parse_size("1GiB"), 1 << 30);
        assert_eq!(parse_size(" 7g "), 7 << 30);
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("lots"), 0);
        assert_eq!(parse_size("12X"), 0);
        assert_eq!(parse_size("-3G"), 0);
    }

    #[test]
    fn test_parse_blkid_pairs() {
        let pairs = parse_blkid_pairs(
            r#"/dev/sdb1: LABEL="My Disk" UUID="1234-ABCD" BLOCK_SIZE="4096" TYPE="ext4" PARTUUID="ff-01""#,
        );
        assert_eq!(pairs.get("LABEL").map(String::as_str), Some("My Disk"));
        assert_eq!(pairs.get("UUID").map(String::as_str), Some("1234-ABCD"));
        assert_eq!(pairs.get("TYPE").map(String::as_str), Some("ext4"));
        assert_eq!(pairs.get("PARTUUID").map(String::as_str), Some("ff-01"));
        assert!(parse_blkid_pairs("").is_empty());
    }

    #[test]
    fn test_sanitize_and_suggested_names() {
        assert_eq!(sanitize_mount_name("My Games"), "My_Games");
        assert_eq!(sanitize_mount_name("Test-Drive_123"), "Test_Drive_123");
        assert_eq!(sanitize_mount_name("Game/Data"), "Game_Data");

        let mut device = parse_lsblk(SINGLE_DISK_JSON).unwrap().remove(0);
        assert_eq!(device.suggested_mount_name(), "BACKUP");
        assert_eq!(device.fstab_spec(), "UUID=1234-5678-ABCD");

        device.label.clear();
        assert_eq!(device.suggested_mount_name(), "1234-567");
        assert_eq!(device.link_name(), "sdb");

        device.uuid.clear();
        assert_eq!(device.suggested_mount_name(), "sdb");
        assert_eq!(device.fstab_spec(), "/dev/sdb");
    }

    #[test]
    fn test_detect_devices_single_disk_scenario() {
        let runner = ScriptedRunner::new(|program, _| match program {
            "lsblk" => Ok(ok(SINGLE_DISK_JSON)),
            other => panic!("unexpected command {}", other),
        });
        let probe = FakeProbe::default();
        let session = StorageSession::new();
        let scratch = tempfile::tempdir().unwrap();
        let config = StorageConfig::new().with_scratch_root(scratch.path());

        let devices = detect_devices(&runner, &probe, &session, &config).unwrap();

        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.device_path, PathBuf::from("/dev/sdb"));
        assert_eq!(device.size_bytes, 32 * 1024u64.pow(3));
        assert_eq!(device.filesystem_type, "ext4");
        assert_eq!(device.label, "BACKUP");
        assert_eq!(device.uuid, "1234-5678-ABCD");
        assert!(!device.is_mounted);
        assert!(!device.is_system);
        // Label, UUID and type were all present: no blkid round trip.
        assert!(runner.calls_to("blkid").is_empty());
        assert_eq!(probe.events(), vec!["mount /dev/sdb", "unmount"]);
    }

    #[test]
    fn test_detect_devices_enriches_and_flags_system() {
        let runner = ScriptedRunner::new(|program, args| match program {
            "lsblk" => Ok(ok(r#"{"blockdevices": [
                {"name": "sdb", "size": "16G", "type": "disk", "hotplug": true, "children": [
                    {"name": "sdb1", "size": "16G", "type": "part", "hotplug": true},
                    {"name": "sdb2", "size": "1M", "type": "part", "hotplug": true}
                ]}
            ]}"#)),
            "blkid" if args == ["/dev/sdb1"] => Ok(ok(
                r#"/dev/sdb1: LABEL="rootfs" UUID="dead-beef" TYPE="ext4""#,
            )),
            "blkid" => Ok(failed(2, "")),
            other => panic!("unexpected command {}", other),
        });
        let probe = FakeProbe::with_system(&["/dev/sdb1"]);
        let session = StorageSession::new();
        let scratch = tempfile::tempdir().unwrap();
        let config = StorageConfig::new().with_scratch_root(scratch.path());

        let devices = detect_devices(&runner, &probe, &session, &config).unwrap();
        assert_eq!(devices.len(), 3);

        let disk = &devices[0];
        assert_eq!(disk.filesystem_type, UNKNOWN_FILESYSTEM);
        assert!(!disk.is_system);

        let sdb1 = &devices[1];
        assert_eq!(sdb1.label, "rootfs");
        assert_eq!(sdb1.uuid, "dead-beef");
        assert_eq!(sdb1.filesystem_type, "ext4");
        assert!(sdb1.is_system);

        // blkid failure is not fatal.
        assert_eq!(devices[2].filesystem_type, UNKNOWN_FILESYSTEM);
        // Only the device with a filesystem was probe-mounted.
        assert_eq!(probe.events(), vec!["mount /dev/sdb1", "unmount"]);
    }

    #[test]
    fn test_detect_devices_checks_mounted_device_in_place() {
        let mounted_root = tempfile::tempdir().unwrap();
        std::fs::create_dir(mounted_root.path().join("boot")).unwrap();
        let json = format!(
            r#"{{"blockdevices": [{{"name": "sdc1", "size": "8G", "type": "part", "hotplug": true,
                "fstype": "ext4", "label": "L", "uuid": "U", "mountpoint": "{}"}}]}}"#,
            mounted_root.path().display()
        );
        let runner = ScriptedRunner::new(move |_, _| Ok(ok(&json)));
        let probe = FakeProbe::default();
        let session = StorageSession::new();
        let config = StorageConfig::new();

        let devices = detect_devices(&runner, &probe, &session, &config).unwrap();
        assert!(devices[0].is_system);
        assert!(probe.events().is_empty());
    }

    #[test]
    fn test_detect_devices_lsblk_failure() {
        let runner = ScriptedRunner::new(|_, _| Ok(failed(1, "lsblk: boom")));
        let probe = FakeProbe::default();
        let session = StorageSession::new();
        let err = detect_devices(&runner, &probe, &session, &StorageConfig::new()).unwrap_err();
        assert!(matches!(err, Error::CommandExit { .. }));
    }

    #[test]
    fn test_list_disks() {
        let runner = ScriptedRunner::new(|_, args| {
            assert!(args.contains(&"--nodeps"));
            Ok(ok(r#"{"blockdevices": [
                {"name": "sda", "type": "disk"},
                {"name": "nvme0n1", "type": "disk"},
                {"name": "sr0", "type": "rom"},
                {"name": "loop0", "type": "loop"}
            ]}"#))
        });
        let disks = list_disks(&runner, &Timeouts::default()).unwrap();
        assert_eq!(
            disks,
            vec![PathBuf::from("/dev/sda"), PathBuf::from("/dev/nvme0n1")]
        );
    }
}
