//! Bulk mounting driven by declarative selection rules.
//!
//! Selection modes, first match wins:
//! 1. an explicit device list
//! 2. criteria (size bounds, filesystem set, label pattern)
//! 3. every unmounted, non-system device
//!
//! Mounted and system devices are never selected. Each device is mounted on
//! its own; a failure is recorded and the batch continues.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::disk::{self, BlockDevice};
use crate::error::{InvalidPatternSnafu, Result};
use crate::executor::CommandRunner;
use crate::fstab::PersistMode;
use crate::mount::{self, MountOutcome, MountRequest};
use crate::preset::MountOptions;
use crate::probe::DeviceProbe;
use crate::session::StorageSession;

/// Filters applied in criteria mode. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
    /// Allowed filesystem types, compared case-insensitively.
    pub filesystems: Vec<String>,
    /// Case-insensitive glob matched against the label. A pattern without
    /// glob metacharacters matches as a substring.
    pub label_pattern: Option<String>,
}

impl SelectionCriteria {
    pub fn is_empty(&self) -> bool {
        self.min_size_bytes.is_none()
            && self.max_size_bytes.is_none()
            && self.filesystems.is_empty()
            && self.label_pattern.is_none()
    }

    fn compile(&self) -> Result<CompiledCriteria<'_>> {
        let label = match &self.label_pattern {
            Some(pattern) => Some(compile_label_pattern(pattern)?),
            None => None,
        };
        Ok(CompiledCriteria {
            criteria: self,
            label,
        })
    }
}

struct CompiledCriteria<'a> {
    criteria: &'a SelectionCriteria,
    label: Option<GlobMatcher>,
}

impl CompiledCriteria<'_> {
    fn matches(&self, device: &BlockDevice) -> bool {
        let c = self.criteria;
        if c.min_size_bytes.is_some_and(|min| device.size_bytes < min) {
            return false;
        }
        if c.max_size_bytes.is_some_and(|max| device.size_bytes > max) {
            return false;
        }
        if !c.filesystems.is_empty()
            && !c
                .filesystems
                .iter()
                .any(|fs| fs.eq_ignore_ascii_case(&device.filesystem_type))
        {
            return false;
        }
        match &self.label {
            Some(matcher) => matcher.is_match(&device.label),
            None => true,
        }
    }
}

fn compile_label_pattern(pattern: &str) -> Result<GlobMatcher> {
    let has_meta = pattern.contains(['*', '?', '[', '{']);
    let glob = if has_meta {
        pattern.to_string()
    } else {
        format!("*{}*", pattern)
    };

    let glob = GlobBuilder::new(&glob)
        .case_insensitive(true)
        .build()
        .context(InvalidPatternSnafu { pattern })?;
    Ok(glob.compile_matcher())
}

/// What to mount and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSetupConfig {
    /// Explicit device paths. Takes priority over `criteria`.
    pub devices: Vec<PathBuf>,
    pub criteria: Option<SelectionCriteria>,
    pub mount_options: MountOptions,
    pub persistent: bool,
    pub persist_mode: PersistMode,
    /// Create a link per mounted device under the links directory.
    pub create_links: bool,
}

/// Which selection mode was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Explicit,
    Criteria,
    AllUnmounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Skip,
    Mount,
    Persist,
    Link,
}

/// One step taken (or declined) during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupAction {
    pub kind: ActionKind,
    pub device: PathBuf,
    pub target: Option<PathBuf>,
    pub success: bool,
    pub message: Option<String>,
}

impl SetupAction {
    fn skipped(device: &Path, reason: &str) -> Self {
        Self {
            kind: ActionKind::Skip,
            device: device.to_path_buf(),
            target: None,
            success: true,
            message: Some(reason.to_string()),
        }
    }
}

/// A device that could not be mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMount {
    pub device: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoSetupReport {
    pub mode: SelectionMode,
    pub mounted: Vec<MountOutcome>,
    pub failed: Vec<FailedMount>,
    pub actions: Vec<SetupAction>,
}

/// Devices chosen for mounting plus the reasons others were passed over.
#[derive(Debug)]
pub struct Selection<'a> {
    pub mode: SelectionMode,
    pub selected: Vec<&'a BlockDevice>,
    pub missing: Vec<PathBuf>,
    pub skipped: Vec<SetupAction>,
}

/// Applies the selection rules to a discovery snapshot.
pub fn select_devices<'a>(
    devices: &'a [BlockDevice],
    setup: &AutoSetupConfig,
) -> Result<Selection<'a>> {
    let mut selection = Selection {
        mode: SelectionMode::AllUnmounted,
        selected: Vec::new(),
        missing: Vec::new(),
        skipped: Vec::new(),
    };

    let candidates: Vec<&BlockDevice> = if !setup.devices.is_empty() {
        selection.mode = SelectionMode::Explicit;
        let mut found = Vec::new();
        for path in &setup.devices {
            match disk::find_device(devices, path) {
                Some(device) => found.push(device),
                None => selection.missing.push(path.clone()),
            }
        }
        found
    } else if let Some(criteria) = setup.criteria.as_ref().filter(|c| !c.is_empty()) {
        selection.mode = SelectionMode::Criteria;
        let compiled = criteria.compile()?;
        devices.iter().filter(|d| compiled.matches(d)).collect()
    } else {
        devices.iter().collect()
    };

    for device in candidates {
        let reason = if device.is_mounted {
            Some("already mounted")
        } else if device.is_system {
            Some("system device")
        } else if selection.mode != SelectionMode::Explicit && !device.has_filesystem() {
            Some("no filesystem")
        } else {
            None
        };

        match reason {
            Some(reason) => selection
                .skipped
                .push(SetupAction::skipped(&device.device_path, reason)),
            None => selection.selected.push(device),
        }
    }

    Ok(selection)
}

/// Mounts every selected device and optionally links them into the links
/// directory.
pub fn auto_setup(
    runner: &dyn CommandRunner,
    probe: &dyn DeviceProbe,
    session: &StorageSession,
    config: &StorageConfig,
    setup: &AutoSetupConfig,
) -> Result<AutoSetupReport> {
    let devices = disk::detect_devices(runner, probe, session, config)?;
    let selection = select_devices(&devices, setup)?;
    info!(mode = ?selection.mode, selected = selection.selected.len(), "auto setup");

    let mut report = AutoSetupReport {
        mode: selection.mode,
        mounted: Vec::new(),
        failed: selection
            .missing
            .iter()
            .map(|path| FailedMount {
                device: path.clone(),
                error: format!("device {} not found among removable devices", path.display()),
            })
            .collect(),
        actions: selection.skipped,
    };

    for device in selection.selected {
        let mut request = MountRequest::new(&device.device_path)
            .with_options(setup.mount_options.clone());
        if setup.persistent {
            request = request.persistent(setup.persist_mode);
        }

        match mount::mount_device(runner, session, config, device, &request) {
            Ok(outcome) => {
                report.actions.push(SetupAction {
                    kind: ActionKind::Mount,
                    device: device.device_path.clone(),
                    target: Some(outcome.mount_point.clone()),
                    success: true,
                    message: outcome.options.clone(),
                });
                if let Some(error) = &outcome.persist_error {
                    report.actions.push(SetupAction {
                        kind: ActionKind::Persist,
                        device: device.device_path.clone(),
                        target: Some(config.fstab_path.clone()),
                        success: false,
                        message: Some(error.clone()),
                    });
                }
                report.mounted.push(outcome);
            }
            Err(e) => {
                warn!(device = %device.device_path.display(), error = %e, "auto setup mount failed");
                report.actions.push(SetupAction {
                    kind: ActionKind::Mount,
                    device: device.device_path.clone(),
                    target: None,
                    success: false,
                    message: Some(e.to_string()),
                });
                report.failed.push(FailedMount {
                    device: device.device_path.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if setup.create_links && !report.mounted.is_empty() {
        let links = create_links(runner, config, &report.mounted);
        report.actions.extend(links);
    }

    Ok(report)
}

/// Links each mounted device into `config.links_dir`.
///
/// Existing links and files at the link path are replaced. A real directory
/// there is left alone and reported as a failed action, as is a second
/// device whose link name is already taken in this batch.
pub fn create_links(
    runner: &dyn CommandRunner,
    config: &StorageConfig,
    mounted: &[MountOutcome],
) -> Vec<SetupAction> {
    let options = config.timeouts.short().privileged();
    let links_dir = config.links_dir.to_string_lossy();
    if let Err(e) = runner
        .run("mkdir", &["-p", &links_dir], options)
        .and_then(|o| o.into_checked("mkdir"))
    {
        warn!(links_dir = %links_dir, error = %e, "failed to create links directory");
    }

    let mut actions = Vec::new();
    let mut claimed: HashMap<PathBuf, &Path> = HashMap::new();
    for outcome in mounted {
        let link = config.links_dir.join(outcome.device.link_name());
        let mut action = SetupAction {
            kind: ActionKind::Link,
            device: outcome.device.device_path.clone(),
            target: Some(link.clone()),
            success: false,
            message: None,
        };

        if let Some(owner) = claimed.get(&link) {
            warn!(link = %link.display(), owner = %owner.display(), "link name already used in this batch");
            action.message = Some(format!("link name already used by {}", owner.display()));
            actions.push(action);
            continue;
        }

        let is_real_dir = fs::symlink_metadata(&link).is_ok_and(|m| m.file_type().is_dir());
        if is_real_dir {
            warn!(link = %link.display(), "a directory already exists at the link path");
            action.message = Some("a directory already exists at the link path".to_string());
            actions.push(action);
            continue;
        }

        let source_arg = outcome.mount_point.to_string_lossy();
        let link_arg = link.to_string_lossy();
        match runner
            .run("ln", &["-sfn", &source_arg, &link_arg], options)
            .and_then(|o| o.into_checked("ln"))
        {
            Ok(_) => {
                info!(link = %link.display(), mount_point = %outcome.mount_point.display(), "linked");
                claimed.insert(link.clone(), &outcome.device.device_path);
                action.success = true;
            }
            Err(e) => {
                warn!(link = %link.display(), error = %e, "failed to create link");
                action.message = Some(e.to_string());
            }
        }
        actions.push(action);
    }
    actions
}
