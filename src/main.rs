use anyhow::{bail, Result};
use std::sync::Arc;
use survey_backup::backup::{BackupHandle, BackupManager, BackupRequest, SessionReport};
use survey_backup::bridge::{adb, AdbRunner, CommandRunner};
use survey_backup::device::{DetectedDevice, Detector, DeviceEvent, DeviceWatcher, ProfileResolver};
use survey_backup::utils::{self, Config};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::logging::init_tracing();

    let config = Arc::new(utils::config::load_config()?);
    info!("Starting survey-backup v{}", env!("CARGO_PKG_VERSION"));
    info!("Backups go to {}", config.backup_root.display());

    if !adb::bridge_available(&config.adb_path) {
        bail!(
            "Bridge binary '{}' not found; install platform-tools or set SURVEY_BACKUP_ADB_PATH",
            config.adb_path.display()
        );
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(AdbRunner::from_config(&config));
    match adb::bridge_version(runner.as_ref()).await {
        Some(version) => info!("Using {}", version),
        None => warn!("Could not determine bridge version"),
    }

    let auto_backup = match (&config.job_id, &config.technician) {
        (Some(job), Some(tech)) => Some((job.clone(), tech.clone())),
        _ => {
            info!("No job id and technician configured, watching devices only");
            None
        }
    };

    let (watcher, mut events) = DeviceWatcher::new(runner.clone(), &config).start();
    let manager = BackupManager::new(runner.clone(), config.clone());
    let resolver = ProfileResolver::new(&config.families);
    let mut detector = Detector::new();
    let mut active: Option<BackupHandle> = None;
    let mut backup_started = false;
    let mut failed = false;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let step = tokio::select! {
            _ = &mut shutdown => Step::Shutdown,
            event = events.recv() => Step::Device(event),
            report = join_active(&mut active) => Step::Finished(report),
        };

        match step {
            Step::Shutdown => break,
            Step::Device(Some(DeviceEvent::Connected(serial))) => {
                let detected = match detector
                    .on_connected(runner.as_ref(), resolver, &serial)
                    .await
                {
                    Ok(Some(detected)) => detected,
                    Ok(None) => {
                        debug!("{} already detected", serial);
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to query device {}: {}", serial, e);
                        continue;
                    }
                };
                describe(&detected, &config);

                if let Some((job, tech)) = &auto_backup {
                    if !backup_started && active.is_none() && detected.is_compatible() {
                        let request =
                            BackupRequest::from_detected(&detected, job, tech, config.deep_scan);
                        info!("Starting backup of {} folders", request.selected_folders.len());
                        active = Some(manager.start(request));
                        backup_started = true;
                    }
                }
            }
            Step::Device(Some(DeviceEvent::Disconnected(serial))) => {
                info!("Device {} disconnected", serial);
                detector.on_disconnected(&serial);
            }
            Step::Device(None) => {
                warn!("Device watcher stopped unexpectedly");
                break;
            }
            Step::Finished(report) => {
                active = None;
                failed |= !report.success;
                summarize(&report);
                if config.exit_after_backup {
                    break;
                }
            }
        }
    }

    if let Some(mut handle) = active.take() {
        handle.cancel().await;
        let report = handle.join().await;
        failed |= !report.success;
        summarize(&report);
    }

    watcher.stop().await;
    info!("Stopped");

    if failed {
        bail!("Backup did not complete");
    }
    Ok(())
}

enum Step {
    Shutdown,
    Device(Option<DeviceEvent>),
    Finished(SessionReport),
}

async fn join_active(active: &mut Option<BackupHandle>) -> SessionReport {
    match active.as_mut() {
        Some(handle) => handle.join().await,
        None => std::future::pending().await,
    }
}

fn describe(detected: &DetectedDevice, config: &Config) {
    let device = &detected.device;
    match &detected.family {
        Some(family) => {
            info!(
                "{} {} ready (serial {}, Android {}, firmware {})",
                device.manufacturer,
                device.model,
                device.serial,
                device.android_version,
                device.firmware
            );
            for folder in &family.folders {
                info!(
                    "  [{}] {}",
                    if folder.selected { "x" } else { " " },
                    folder.path
                );
            }
        }
        None => warn!("{} ({}) is not a supported data collector", device.model, device.id),
    }

    if device.serial_suspicious {
        if config.block_suspicious_serial {
            warn!("Serial '{}' looks invalid; backups are blocked", device.serial);
        } else {
            warn!("Serial '{}' looks invalid", device.serial);
        }
    }
}

fn summarize(report: &SessionReport) {
    let root = report
        .root
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());

    if report.success {
        info!(
            "Backup finished: {} paths pulled into {} in {}",
            report.pulled.len(),
            root,
            humantime::format_duration(std::time::Duration::from_secs(report.elapsed.as_secs()))
        );
    } else {
        error!("Backup ended in state {:?}, see transcript above", report.state);
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
