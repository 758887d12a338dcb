//! Drive health from smartctl's JSON output.
//!
//! ATA and NVMe drives report different attribute sets, so per-type metrics
//! live in [`DriveMetrics`] while the verdict and the display attribute list
//! are shared by every drive type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::disk;
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandRunner};

/// ATA attribute IDs that predict failure.
pub const CRITICAL_ATTRIBUTE_IDS: [u32; 9] = [5, 10, 184, 187, 188, 196, 197, 198, 201];

/// Temperature above which a drive is reported hot, in °C.
pub const MAX_TEMPERATURE_C: i64 = 55;

/// NVMe wear level above which a drive is reported worn, in percent.
pub const MAX_NVME_PERCENTAGE_USED: u64 = 90;

/// NVMe spare capacity below which a drive is reported low, in percent.
pub const MIN_NVME_AVAILABLE_SPARE: u64 = 10;

const ATA_REALLOCATED: u32 = 5;
const ATA_POWER_ON_HOURS: u32 = 9;
const ATA_TEMPERATURE: u32 = 194;
const ATA_PENDING: u32 = 197;
const ATA_UNCORRECTABLE: u32 = 198;

const NO_SUCH_DEVICE: &str = "No such device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Failing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Hdd,
    Ssd,
    Nvme,
    Unknown,
}

/// Counters reported by ATA drives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtaMetrics {
    pub reallocated_sectors: Option<u64>,
    pub pending_sectors: Option<u64>,
    pub uncorrectable_errors: Option<u64>,
}

/// Counters from the NVMe health log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeMetrics {
    pub percentage_used: Option<u64>,
    pub available_spare: Option<u64>,
    pub media_errors: Option<u64>,
}

/// Per-type metrics. Serialized with a `drive_type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "drive_type", rename_all = "lowercase")]
pub enum DriveMetrics {
    Hdd(AtaMetrics),
    Ssd(AtaMetrics),
    Nvme(NvmeMetrics),
    Unknown(AtaMetrics),
}

impl DriveMetrics {
    pub fn drive_type(&self) -> DriveType {
        match self {
            Self::Hdd(_) => DriveType::Hdd,
            Self::Ssd(_) => DriveType::Ssd,
            Self::Nvme(_) => DriveType::Nvme,
            Self::Unknown(_) => DriveType::Unknown,
        }
    }

    fn ata_mut(&mut self) -> Option<&mut AtaMetrics> {
        match self {
            Self::Hdd(m) | Self::Ssd(m) | Self::Unknown(m) => Some(m),
            Self::Nvme(_) => None,
        }
    }
}

/// One row of the attribute table shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartAttribute {
    /// ATA attribute ID; None for NVMe log fields.
    pub id: Option<u32>,
    pub name: String,
    pub value: Option<i64>,
    pub worst: Option<i64>,
    pub threshold: Option<i64>,
    pub raw: u64,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub device: String,
    pub model: String,
    pub serial: String,
    #[serde(flatten)]
    pub metrics: DriveMetrics,
    pub smart_available: bool,
    pub smart_enabled: bool,
    pub health_status: HealthStatus,
    pub temperature_c: Option<i64>,
    pub power_on_hours: Option<u64>,
    pub attributes: Vec<SmartAttribute>,
    pub warnings: Vec<String>,
    /// Query failure text, or the warnings joined with `; `.
    pub error_message: Option<String>,
}

impl HealthRecord {
    /// A record carrying no data, for `device`.
    pub fn empty(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            model: "Unknown".to_string(),
            serial: "Unknown".to_string(),
            metrics: DriveMetrics::Unknown(AtaMetrics::default()),
            smart_available: false,
            smart_enabled: false,
            health_status: HealthStatus::Unknown,
            temperature_c: None,
            power_on_hours: None,
            attributes: Vec::new(),
            warnings: Vec::new(),
            error_message: None,
        }
    }

    fn failed(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::empty(device)
        }
    }

    pub fn drive_type(&self) -> DriveType {
        self.metrics.drive_type()
    }
}

// smartctl --json layout. Everything is optional: the set of keys depends on
// the drive, the transport and the smartctl version.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartctlReport {
    smartctl: Option<SmartctlMeta>,
    device: Option<SmartctlDevice>,
    model_name: Option<String>,
    serial_number: Option<String>,
    rotation_rate: Option<i64>,
    temperature: Option<CurrentTemperature>,
    power_on_time: Option<PowerOnTime>,
    smart_support: Option<SmartSupport>,
    smart_status: Option<SmartStatus>,
    ata_smart_attributes: Option<AtaAttributeTable>,
    nvme_smart_health_information_log: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartctlMeta {
    messages: Vec<SmartctlMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartctlMessage {
    string: String,
    severity: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartctlDevice {
    #[serde(rename = "type")]
    device_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CurrentTemperature {
    current: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PowerOnTime {
    hours: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartSupport {
    available: Option<bool>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmartStatus {
    passed: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtaAttributeTable {
    table: Vec<AtaAttributeRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtaAttributeRow {
    id: u32,
    name: String,
    value: Option<i64>,
    worst: Option<i64>,
    thresh: Option<i64>,
    raw: AtaRawValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtaRawValue {
    value: u64,
}

fn classify_drive_type(report: &SmartctlReport) -> DriveType {
    let is_nvme = report
        .device
        .as_ref()
        .and_then(|d| d.device_type.as_deref())
        .is_some_and(|t| t.to_lowercase().contains("nvme"));

    if is_nvme {
        return DriveType::Nvme;
    }
    match report.rotation_rate {
        Some(0) => DriveType::Ssd,
        Some(rate) if rate > 0 => DriveType::Hdd,
        _ => DriveType::Unknown,
    }
}

/// Parses smartctl JSON into a classified record.
pub fn parse_smartctl_json(device: &str, json: &str) -> std::result::Result<HealthRecord, serde_json::Error> {
    let report: SmartctlReport = serde_json::from_str(json)?;
    let mut record = HealthRecord::empty(device);

    if let Some(model) = report.model_name.clone().filter(|m| !m.is_empty()) {
        record.model = model;
    }
    if let Some(serial) = report.serial_number.clone().filter(|s| !s.is_empty()) {
        record.serial = serial;
    }
    record.temperature_c = report.temperature.as_ref().and_then(|t| t.current);
    record.power_on_hours = report.power_on_time.as_ref().and_then(|p| p.hours);

    let support = report.smart_support.as_ref();
    // NVMe drives often omit smart_support but still report a verdict.
    record.smart_available = support
        .and_then(|s| s.available)
        .unwrap_or(report.smart_status.is_some());
    record.smart_enabled = support
        .and_then(|s| s.enabled)
        .unwrap_or(record.smart_available);

    record.metrics = match classify_drive_type(&report) {
        DriveType::Nvme => DriveMetrics::Nvme(extract_nvme(&report, &mut record)),
        DriveType::Ssd => DriveMetrics::Ssd(AtaMetrics::default()),
        DriveType::Hdd => DriveMetrics::Hdd(AtaMetrics::default()),
        DriveType::Unknown => DriveMetrics::Unknown(AtaMetrics::default()),
    };
    extract_ata(&report, &mut record);

    let passed = report.smart_status.as_ref().and_then(|s| s.passed);
    classify(&mut record, passed);

    if record.error_message.is_none() && !record.smart_available {
        let messages: Vec<&str> = report
            .smartctl
            .iter()
            .flat_map(|m| &m.messages)
            .filter(|m| m.severity == "error")
            .map(|m| m.string.as_str())
            .collect();
        if !messages.is_empty() {
            record.error_message = Some(messages.join("; "));
        }
    }

    Ok(record)
}

fn extract_nvme(report: &SmartctlReport, record: &mut HealthRecord) -> NvmeMetrics {
    let Some(log) = &report.nvme_smart_health_information_log else {
        return NvmeMetrics::default();
    };

    let field = |key: &str| log.get(key).and_then(Value::as_u64);
    let metrics = NvmeMetrics {
        percentage_used: field("percentage_used"),
        available_spare: field("available_spare"),
        media_errors: field("media_errors"),
    };
    if record.temperature_c.is_none() {
        record.temperature_c = log.get("temperature").and_then(Value::as_i64);
    }

    for (key, value) in log {
        if let Some(raw) = value.as_u64() {
            record.attributes.push(SmartAttribute {
                id: None,
                name: key.clone(),
                value: None,
                worst: None,
                threshold: None,
                raw,
                critical: false,
            });
        }
    }
    metrics
}

fn extract_ata(report: &SmartctlReport, record: &mut HealthRecord) {
    let Some(table) = &report.ata_smart_attributes else {
        return;
    };

    let mut counters: HashMap<u32, u64> = HashMap::new();
    for row in &table.table {
        let raw = row.raw.value;
        match row.id {
            ATA_REALLOCATED | ATA_PENDING | ATA_UNCORRECTABLE => {
                counters.insert(row.id, raw);
            }
            // The upper bytes hold min/max readings on many drives.
            ATA_TEMPERATURE if record.temperature_c.is_none() => {
                record.temperature_c = Some((raw & 0xFF) as i64);
            }
            ATA_POWER_ON_HOURS if record.power_on_hours.is_none() => {
                record.power_on_hours = Some(raw);
            }
            _ => {}
        }

        record.attributes.push(SmartAttribute {
            id: Some(row.id),
            name: row.name.clone(),
            value: row.value,
            worst: row.worst,
            threshold: row.thresh,
            raw,
            critical: CRITICAL_ATTRIBUTE_IDS.contains(&row.id),
        });
    }

    if let Some(ata) = record.metrics.ata_mut() {
        ata.reallocated_sectors = counters.get(&ATA_REALLOCATED).copied();
        ata.pending_sectors = counters.get(&ATA_PENDING).copied();
        ata.uncorrectable_errors = counters.get(&ATA_UNCORRECTABLE).copied();
    }
}

/// Derives the health verdict.
///
/// A failed self-assessment wins outright. Otherwise threshold warnings make
/// the drive `Warning`; a clean drive is `Healthy` only if SMART is
/// available.
pub fn classify(record: &mut HealthRecord, self_assessment_passed: Option<bool>) {
    if self_assessment_passed == Some(false) {
        record.health_status = HealthStatus::Failing;
        return;
    }

    let mut warnings = Vec::new();
    match &record.metrics {
        DriveMetrics::Hdd(ata) | DriveMetrics::Ssd(ata) | DriveMetrics::Unknown(ata) => {
            if let Some(n) = ata.reallocated_sectors.filter(|n| *n > 0) {
                warnings.push(format!("Reallocated sectors: {}", n));
            }
            if let Some(n) = ata.pending_sectors.filter(|n| *n > 0) {
                warnings.push(format!("Pending sectors: {}", n));
            }
            if let Some(n) = ata.uncorrectable_errors.filter(|n| *n > 0) {
                warnings.push(format!("Uncorrectable errors: {}", n));
            }
        }
        DriveMetrics::Nvme(nvme) => {
            if let Some(n) = nvme.percentage_used.filter(|n| *n > MAX_NVME_PERCENTAGE_USED) {
                warnings.push(format!("NVMe wear: {}% used", n));
            }
            if let Some(n) = nvme.available_spare.filter(|n| *n < MIN_NVME_AVAILABLE_SPARE) {
                warnings.push(format!("Low available spare: {}%", n));
            }
            if let Some(n) = nvme.media_errors.filter(|n| *n > 0) {
                warnings.push(format!("Media errors: {}", n));
            }
        }
    }
    if let Some(t) = record.temperature_c.filter(|t| *t > MAX_TEMPERATURE_C) {
        warnings.push(format!("High temperature: {}°C", t));
    }

    record.health_status = if !warnings.is_empty() {
        record.error_message = Some(warnings.join("; "));
        HealthStatus::Warning
    } else if record.smart_available {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    };
    record.warnings = warnings;
}

fn run_smartctl(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    device: &str,
    sat: bool,
) -> Result<CommandOutput> {
    let mut args = vec!["--json", "-a"];
    if sat {
        args.extend(["-d", "sat"]);
    }
    args.push(device);
    // smartctl's exit status is a bit mask of findings, not a failure flag.
    runner.run(
        "smartctl",
        &args,
        timeouts.health().ignore_failure().privileged(),
    )
}

/// True when a direct attempt produced nothing and a SAT retry could help.
fn wants_sat_retry(attempt: &Result<CommandOutput>) -> bool {
    match attempt {
        Ok(output) => output.stdout.trim().is_empty() && !output.stderr.contains(NO_SUCH_DEVICE),
        // smartctl itself is missing; the retry would fail the same way.
        Err(Error::CommandExecution { .. }) => false,
        Err(e) => !e.to_string().contains(NO_SUCH_DEVICE),
    }
}

/// Queries one device. Never fails: problems end up in `error_message`.
///
/// A direct query that produces no output is retried once through the SAT
/// transport, which USB bridges commonly require.
pub fn get_smart_data(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    device: &Path,
    use_sat: bool,
) -> HealthRecord {
    let device_arg = device.to_string_lossy();

    let mut attempt = run_smartctl(runner, timeouts, &device_arg, use_sat);
    if !use_sat && wants_sat_retry(&attempt) {
        info!(device = %device_arg, "no SMART output, retrying through SAT");
        attempt = run_smartctl(runner, timeouts, &device_arg, true);
    }

    let output = match attempt {
        Ok(output) => output,
        Err(e) => {
            warn!(device = %device_arg, error = %e, "SMART query failed");
            return HealthRecord::failed(device_arg, e.to_string());
        }
    };

    if output.stdout.trim().is_empty() {
        let stderr = output.stderr.trim();
        let message = if stderr.is_empty() {
            "smartctl produced no output".to_string()
        } else {
            stderr.to_string()
        };
        return HealthRecord::failed(device_arg, message);
    }

    match parse_smartctl_json(&device_arg, &output.stdout) {
        Ok(record) => {
            debug!(device = %device_arg, status = ?record.health_status, "SMART query done");
            record
        }
        Err(e) => HealthRecord::failed(device_arg, format!("failed to parse smartctl output: {}", e)),
    }
}

/// Queries every whole disk concurrently.
///
/// Per-device failures stay inside their own record. If the disks cannot be
/// listed at all the result is empty.
pub fn get_all_smart_data(runner: &dyn CommandRunner, timeouts: &Timeouts) -> Vec<HealthRecord> {
    let disks = match disk::list_disks(runner, timeouts) {
        Ok(disks) => disks,
        Err(e) => {
            error!(error = %e, "failed to enumerate disks for SMART");
            return Vec::new();
        }
    };

    std::thread::scope(|scope| {
        let handles: Vec<(PathBuf, _)> = disks
            .into_iter()
            .map(|disk| {
                let handle = scope.spawn({
                    let disk = disk.clone();
                    move || get_smart_data(runner, timeouts, &disk, false)
                });
                (disk, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(disk, handle)| {
                handle.join().unwrap_or_else(|_| {
                    HealthRecord::failed(disk.display().to_string(), "SMART query panicked")
                })
            })
            .collect()
    })
}
