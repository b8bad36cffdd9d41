pub mod manager;
pub mod manifest;
pub mod scanner;
pub mod worker;

pub use manager::{BackupHandle, BackupManager, SessionContext};
pub use scanner::{DeepScanPlan, DeepScanRules, RemoteTreeEntry};
pub use worker::{BackupWorker, PullOutcome};

use crate::device::{DetectedDevice, Device};
use crate::utils::{Config, LogEntry};
use anyhow::{bail, Result};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Init,
    CreatingDirectory,
    PullingSelected,
    DeepScanning,
    Completed,
    Cancelled,
    Failed,
}

/// What the caller asks a session to do
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub device: Device,
    pub compatible: bool,
    pub job_id: String,
    pub technician: String,
    /// Remote folders, pulled in this order
    pub selected_folders: Vec<String>,
    pub deep_scan: bool,
}

impl BackupRequest {
    /// Request for the family's default-selected folders.
    pub fn from_detected(
        detected: &DetectedDevice,
        job_id: impl Into<String>,
        technician: impl Into<String>,
        deep_scan: bool,
    ) -> Self {
        Self {
            device: detected.device.clone(),
            compatible: detected.is_compatible(),
            job_id: job_id.into(),
            technician: technician.into(),
            selected_folders: detected
                .family
                .as_ref()
                .map(|f| f.default_selection())
                .unwrap_or_default(),
            deep_scan,
        }
    }

    pub fn with_folders(mut self, folders: Vec<String>) -> Self {
        self.selected_folders = folders;
        self
    }

    pub fn validate(&self, config: &Config) -> Result<()> {
        if self.device.id.is_empty() {
            bail!("No device connected");
        }
        if !self.compatible {
            bail!("Device model {} is not supported", self.device.model);
        }
        if self.job_id.trim().is_empty() {
            bail!("Job id is required");
        }
        if self.technician.trim().is_empty() {
            bail!("Technician is required");
        }
        if config.block_suspicious_serial && self.device.serial_suspicious {
            bail!("Device serial '{}' looks invalid", self.device.serial);
        }
        Ok(())
    }
}

/// One backup run, fixed once its root has been created
#[derive(Debug, Clone, Serialize)]
pub struct BackupSession {
    pub root: PathBuf,
    pub device: Device,
    pub technician: String,
    pub job_id: String,
    pub created_at: DateTime<Local>,
    pub selected_folders: Vec<String>,
    pub deep_scan: bool,
}

/// Terminal result of a session. Cancellation counts as failure.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub success: bool,
    pub state: BackupState,
    pub root: Option<PathBuf>,
    /// Remote paths that were transferred
    pub pulled: Vec<String>,
    pub elapsed: Duration,
    pub transcript: Vec<LogEntry>,
}

pub type SharedState = Arc<RwLock<BackupState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFamily, FolderSpec};

    fn device(serial: &str) -> Device {
        Device {
            id: "S1".to_string(),
            model: "TSC7".to_string(),
            manufacturer: "Trimble".to_string(),
            serial: serial.to_string(),
            android_version: "11".to_string(),
            firmware: "f".to_string(),
            build_type: "user".to_string(),
            serial_suspicious: crate::device::profile::is_suspicious_serial(serial),
        }
    }

    fn detected(serial: &str) -> DetectedDevice {
        DetectedDevice {
            device: device(serial),
            family: Some(DeviceFamily {
                name: "trimble".to_string(),
                model_prefixes: vec!["TSC".to_string()],
                folders: vec![
                    FolderSpec::new("/sdcard/A", true),
                    FolderSpec::new("/sdcard/B", false),
                ],
            }),
        }
    }

    #[test]
    fn test_request_uses_default_selection() {
        let request = BackupRequest::from_detected(&detected("5634R01234"), "42", "ana", false);
        assert_eq!(request.selected_folders, vec!["/sdcard/A"]);
        assert!(request.validate(&Config::default()).is_ok());

        let request = request.with_folders(vec!["/sdcard/B".to_string(), "/sdcard/A".to_string()]);
        assert_eq!(request.selected_folders, vec!["/sdcard/B", "/sdcard/A"]);
    }

    #[test]
    fn test_request_requires_job_and_technician() {
        let config = Config::default();
        let request = BackupRequest::from_detected(&detected("5634R01234"), "  ", "ana", false);
        assert!(request.validate(&config).is_err());
        let request = BackupRequest::from_detected(&detected("5634R01234"), "42", "", false);
        assert!(request.validate(&config).is_err());
    }

    #[test]
    fn test_incompatible_device_rejected() {
        let mut det = detected("5634R01234");
        det.family = None;
        let request = BackupRequest::from_detected(&det, "42", "ana", false);
        assert!(request.selected_folders.is_empty());
        assert!(request.validate(&Config::default()).is_err());
    }

    #[test]
    fn test_suspicious_serial_blocks_only_when_configured() {
        let request = BackupRequest::from_detected(&detected("123"), "42", "ana", false);
        let mut config = Config::default();
        assert!(request.validate(&config).is_ok());
        config.block_suspicious_serial = true;
        assert!(request.validate(&config).is_err());
    }
}
