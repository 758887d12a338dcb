//! Request/response boundary for front ends.
//!
//! [`Storage`] owns a runner, a config and a session and exposes every
//! operation as a serializable response with `success` and an optional
//! `error`, so callers never need to handle [`crate::Error`] themselves.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::error;

use crate::config::StorageConfig;
use crate::disk::{self, BlockDevice};
use crate::executor::{CommandRunner, ExecutionContext};
use crate::fstab::PersistOutcome;
use crate::health::{self, HealthRecord};
use crate::mount::{self, DiskUsage, MountRequest};
use crate::probe::SystemProbe;
use crate::session::StorageSession;
use crate::setup::{self, AutoSetupConfig, FailedMount, SelectionMode, SetupAction};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceListResponse {
    pub success: bool,
    pub devices: Vec<BlockDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MountResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    pub already_mounted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<BlockDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<PersistOutcome>,
    /// The device is mounted but its fstab entry was not written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<DiskUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmountResponse {
    pub success: bool,
    pub mount_point: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoSetupResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SelectionMode>,
    pub mounted: Vec<MountResponse>,
    pub failed: Vec<FailedMount>,
    pub actions: Vec<SetupAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub drives: Vec<HealthRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<mount::MountOutcome> for MountResponse {
    fn from(outcome: mount::MountOutcome) -> Self {
        Self {
            success: true,
            mount_point: Some(outcome.mount_point),
            options: outcome.options,
            already_mounted: outcome.already_mounted,
            device_info: Some(outcome.device),
            persisted: outcome.persisted,
            persist_error: outcome.persist_error,
            usage: outcome.usage,
            error: None,
        }
    }
}

/// Entry point for front ends.
pub struct Storage<R: CommandRunner = ExecutionContext> {
    runner: R,
    config: StorageConfig,
    session: StorageSession,
}

impl Storage<ExecutionContext> {
    /// Uses the real system with the escalation method from `config`.
    pub fn from_config(config: StorageConfig) -> Self {
        let runner = ExecutionContext::with_escalation(config.escalation);
        Self::new(runner, config)
    }
}

impl<R: CommandRunner> Storage<R> {
    pub fn new(runner: R, config: StorageConfig) -> Self {
        Self {
            runner,
            config,
            session: StorageSession::new(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn session(&self) -> &StorageSession {
        &self.session
    }

    fn probe(&self) -> SystemProbe<'_> {
        SystemProbe::new(&self.runner, &self.config.timeouts)
    }

    pub fn list_devices(&self) -> DeviceListResponse {
        match disk::detect_devices(&self.runner, &self.probe(), &self.session, &self.config) {
            Ok(devices) => DeviceListResponse {
                success: true,
                devices,
                error: None,
            },
            Err(e) => {
                error!(error = %e, "device discovery failed");
                DeviceListResponse {
                    success: false,
                    devices: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn smart_mount(&self, request: &MountRequest) -> MountResponse {
        match mount::smart_mount(
            &self.runner,
            &self.probe(),
            &self.session,
            &self.config,
            request,
        ) {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                error!(device = %request.device.display(), error = %e, "mount failed");
                MountResponse {
                    success: false,
                    error: Some(e.to_string()),
                    ..MountResponse::default()
                }
            }
        }
    }

    pub fn unmount(&self, mount_point: &Path) -> UnmountResponse {
        let result = mount::unmount(&self.runner, &self.session, &self.config, mount_point);
        UnmountResponse {
            success: result.is_ok(),
            mount_point: mount_point.to_path_buf(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Runs auto-setup. Per-device failures are listed in `failed`;
    /// `success` is false only when the batch could not run at all.
    pub fn auto_setup(&self, setup: &AutoSetupConfig) -> AutoSetupResponse {
        match setup::auto_setup(
            &self.runner,
            &self.probe(),
            &self.session,
            &self.config,
            setup,
        ) {
            Ok(report) => AutoSetupResponse {
                success: true,
                mode: Some(report.mode),
                mounted: report.mounted.into_iter().map(MountResponse::from).collect(),
                failed: report.failed,
                actions: report.actions,
                error: None,
            },
            Err(e) => {
                error!(error = %e, "auto setup failed");
                AutoSetupResponse {
                    success: false,
                    error: Some(e.to_string()),
                    ..AutoSetupResponse::default()
                }
            }
        }
    }

    /// Queries one drive. `success` mirrors whether a query error occurred;
    /// the record is returned either way.
    pub fn health(&self, device: &Path, use_sat: bool) -> HealthResponse {
        let record = health::get_smart_data(&self.runner, &self.config.timeouts, device, use_sat);
        let failed_query = record.error_message.is_some() && record.warnings.is_empty();
        HealthResponse {
            success: !failed_query,
            error: if failed_query {
                record.error_message.clone()
            } else {
                None
            },
            drives: vec![record],
        }
    }

    pub fn health_all(&self) -> HealthResponse {
        HealthResponse {
            success: true,
            drives: health::get_all_smart_data(&self.runner, &self.config.timeouts),
            error: None,
        }
    }
}
