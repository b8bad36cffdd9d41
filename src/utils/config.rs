use crate::device::profile::{DeviceFamily, FolderSpec};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "SURVEY_BACKUP";
const CONFIG_FILE_ENV: &str = "SURVEY_BACKUP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bridge binary, either a bare name looked up on PATH or a path
    pub adb_path: PathBuf,

    /// Local directory that receives one subdirectory per session
    pub backup_root: PathBuf,

    /// Device storage root that deep scan lists and mirrors from
    pub storage_root: String,

    /// Name of the deep-scan subdirectory inside a session root
    pub extra_dir_name: String,

    /// Extensions (with leading dot) that mark a project file during deep scan
    pub extra_extensions: Vec<String>,

    /// Remote prefixes deep scan never descends into
    pub blocked_paths: Vec<String>,

    /// Device families, checked in order
    pub families: Vec<DeviceFamily>,

    /// Grace period between graceful stop and kill of a cancelled subprocess
    pub terminate_grace_ms: u64,

    /// Sleep while the device tracker has nothing to say
    pub watcher_idle_ms: u64,

    /// Delay before relaunching a device tracker that exited
    pub watcher_restart_ms: u64,

    /// Refuse backups for devices whose serial looks implausible
    pub block_suspicious_serial: bool,

    /// Transcript entries kept per session
    pub log_capacity: usize,

    /// Headless runner: job identifier for the automatic backup
    pub job_id: Option<String>,

    /// Headless runner: technician recorded in the manifest
    pub technician: Option<String>,

    /// Headless runner: run the deep scan after the selected folders
    pub deep_scan: bool,

    /// Headless runner: exit once the automatic backup finished
    pub exit_after_backup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            backup_root: PathBuf::from("backups"),
            storage_root: "/sdcard".to_string(),
            extra_dir_name: "Directorios extra".to_string(),
            extra_extensions: [
                ".csv", ".dxf", ".dwg", ".ttm", ".job", ".jxl", ".t02", ".t04", ".dat", ".rnx",
                ".obs", ".nav", ".shp", ".dbf", ".prj", ".kml", ".kmz", ".txt", ".asc", ".xml",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            blocked_paths: vec![
                "/sdcard/Android".to_string(),
                "/sdcard/DCIM/.thumbnails".to_string(),
                "/sdcard/LOST.DIR".to_string(),
            ],
            families: vec![
                DeviceFamily {
                    name: "trimble".to_string(),
                    model_prefixes: ["TSC5", "TSC510", "TSC710", "TCU5", "TDC6", "TDC600", "TDC100"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    folders: vec![
                        FolderSpec::new("/sdcard/Trimble Data", true),
                        FolderSpec::new("/sdcard/Documents", true),
                        FolderSpec::new("/sdcard/Download", false),
                        FolderSpec::new("/sdcard/Pictures/Screenshots", false),
                    ],
                },
                DeviceFamily {
                    name: "spectra".to_string(),
                    model_prefixes: ["MobileMapper6", "MobileMapper60", "MobileMapper50", "Ranger5"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    folders: vec![
                        FolderSpec::new("/sdcard/Documents", true),
                        FolderSpec::new("/sdcard/Download", true),
                        FolderSpec::new("/sdcard/Pictures/Screenshots", false),
                    ],
                },
            ],
            terminate_grace_ms: 500,
            watcher_idle_ms: 50,
            watcher_restart_ms: 1000,
            block_suspicious_serial: false,
            log_capacity: 1000,
            job_id: None,
            technician: None,
            deep_scan: false,
            exit_after_backup: true,
        }
    }
}

impl Config {
    /// Load config from defaults, an optional TOML file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_file_path() {
            tracing::debug!("Reading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(environment())
            .build()
            .context("failed to assemble configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_root.trim().is_empty() {
            bail!("storage_root must not be empty");
        }
        if !self.storage_root.starts_with('/') {
            bail!("storage_root must be absolute: {}", self.storage_root);
        }
        if let Some(ext) = self.extra_extensions.iter().find(|e| !e.starts_with('.')) {
            bail!("extension must start with '.': {}", ext);
        }
        if let Some(path) = self.blocked_paths.iter().find(|p| !p.starts_with('/')) {
            bail!("blocked path must be absolute: {}", path);
        }
        if let Some(family) = self.families.iter().find(|f| f.folders.is_empty()) {
            bail!("device family '{}' has no folders", family.name);
        }
        Ok(())
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn watcher_idle(&self) -> Duration {
        Duration::from_millis(self.watcher_idle_ms)
    }

    pub fn watcher_restart(&self) -> Duration {
        Duration::from_millis(self.watcher_restart_ms)
    }
}

/// `SURVEY_BACKUP_*` overrides. Values stay strings until deserialized so ids
/// like `0042` keep their leading zeros.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        return Some(PathBuf::from(path));
    }

    let user_file = dirs::config_dir().map(|d| d.join("survey-backup").join("config.toml"));
    match user_file {
        Some(path) if path.exists() => Some(path),
        _ => Some(PathBuf::from("survey-backup.toml")),
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
