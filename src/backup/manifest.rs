//! Session root creation and the `backup_info.txt` manifest

use super::BackupSession;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "backup_info.txt";

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f\s]+"#).expect("valid pattern"));

/// Replace characters that are not portable in a directory name.
pub fn sanitize_component(value: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(value.trim(), "_");
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.into_owned()
    }
}

/// `{model}_{serial}_JOB{job}_{YYYYmmdd_HHMMSS}`
pub fn session_dir_name(model: &str, serial: &str, job_id: &str, at: &DateTime<Local>) -> String {
    format!(
        "{}_{}_JOB{}_{}",
        sanitize_component(model),
        sanitize_component(serial),
        sanitize_component(job_id),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Create `backup_root/name`, appending `-N` until the name is unused.
///
/// The returned directory did not exist before this call.
pub async fn create_unique_dir(backup_root: &Path, name: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(backup_root)
        .await
        .with_context(|| format!("Failed to create backup root {}", backup_root.display()))?;

    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            backup_root.join(name)
        } else {
            backup_root.join(format!("{}-{}", name, attempt))
        };

        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create backup directory {}", candidate.display())
                })
            }
        }
    }
}

pub fn render_manifest(session: &BackupSession) -> String {
    let device = &session.device;
    format!(
        "Model: {}\n\
         Manufacturer: {}\n\
         Serial: {}\n\
         Android: {}\n\
         Firmware: {}\n\
         Job: {}\n\
         Technician: {}\n\
         Created: {}\n\
         Folders: {}\n\
         Deep scan: {}\n",
        device.model,
        device.manufacturer,
        device.serial,
        device.android_version,
        device.firmware,
        session.job_id,
        session.technician,
        session.created_at.format("%Y-%m-%d %H:%M:%S"),
        session.selected_folders.join(", "),
        if session.deep_scan { "yes" } else { "no" },
    )
}

pub async fn write_manifest(session: &BackupSession) -> Result<PathBuf> {
    let path = session.root.join(MANIFEST_FILE);
    tokio::fs::write(&path, render_manifest(session))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
