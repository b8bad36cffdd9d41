//! Bridge subcommands used by the watcher and the backup engine

use super::error::BridgeResult;
use super::runner::{CommandRunner, StreamOutcome};
use crate::device::profile::is_suspicious_serial;
use crate::device::Device;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Prefix `rest` with `-s <serial>` so the command targets one device.
pub fn device_args(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string()];
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

/// Parse `devices` output into `(serial, state)` pairs.
pub fn parse_devices(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some((serial.to_string(), state.to_string()))
        })
        .collect()
}

/// First device that is online, if any.
pub async fn connected_device(runner: &dyn CommandRunner) -> BridgeResult<Option<String>> {
    let output = runner.capture(&["devices".to_string()]).await?;
    Ok(parse_devices(&output)
        .into_iter()
        .find(|(_, state)| state == "device")
        .map(|(serial, _)| serial))
}

pub async fn get_prop(runner: &dyn CommandRunner, serial: &str, key: &str) -> BridgeResult<String> {
    let output = runner
        .capture(&device_args(serial, &["shell", "getprop", key]))
        .await?;
    Ok(output.trim().to_string())
}

/// Query identity and OS properties of an attached device.
///
/// The hardware serial comes from `sys.qc.sn`, falling back to `ro.serialno`.
pub async fn device_info(runner: &dyn CommandRunner, serial: &str) -> BridgeResult<Device> {
    let model = get_prop(runner, serial, "ro.product.model").await?;
    let manufacturer = get_prop(runner, serial, "ro.product.manufacturer").await?;
    let android_version = get_prop(runner, serial, "ro.build.version.release").await?;
    let firmware = get_prop(runner, serial, "ro.build.display.id").await?;
    let build_type = get_prop(runner, serial, "ro.build.type").await?;

    let mut hardware_serial = get_prop(runner, serial, "sys.qc.sn").await?;
    if hardware_serial.is_empty() {
        debug!("sys.qc.sn empty on {}, falling back to ro.serialno", serial);
        hardware_serial = get_prop(runner, serial, "ro.serialno").await?;
    }

    Ok(Device {
        id: serial.to_string(),
        serial_suspicious: is_suspicious_serial(&hardware_serial),
        model,
        manufacturer,
        serial: hardware_serial,
        android_version,
        firmware,
        build_type,
    })
}

/// Regular files under `remote`, recursively. Missing paths yield nothing.
pub async fn list_files(
    runner: &dyn CommandRunner,
    serial: &str,
    remote: &str,
) -> BridgeResult<Vec<String>> {
    let find = format!("find \"{}\" -type f", remote);
    let output = runner.capture(&device_args(serial, &["shell", &find])).await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Raw `ls -R` listing of `root`.
pub async fn list_recursive(
    runner: &dyn CommandRunner,
    serial: &str,
    root: &str,
) -> BridgeResult<String> {
    runner
        .capture(&device_args(serial, &["shell", "ls", "-R", root]))
        .await
}

/// Recursive copy of `remote` into `local`, streaming progress lines.
pub async fn pull(
    runner: &dyn CommandRunner,
    serial: &str,
    remote: &str,
    local: &Path,
    on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    cancel: &CancellationToken,
) -> BridgeResult<StreamOutcome> {
    let local = local.to_string_lossy();
    runner
        .stream(&device_args(serial, &["pull", remote, &local]), on_line, cancel)
        .await
}

/// Tear down the connection to `serial`, aborting in-flight transfers.
pub async fn disconnect(runner: &dyn CommandRunner, serial: &str) -> BridgeResult<()> {
    runner
        .capture(&["disconnect".to_string(), serial.to_string()])
        .await?;
    Ok(())
}

/// First line of `version` output, or `None` if the binary can't say.
pub async fn bridge_version(runner: &dyn CommandRunner) -> Option<String> {
    match runner.capture(&["version".to_string()]).await {
        Ok(output) => output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string),
        Err(e) => {
            debug!("Bridge version unavailable: {}", e);
            None
        }
    }
}

/// Whether the configured bridge binary exists, searching PATH for bare names.
pub fn bridge_available(program: &Path) -> bool {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file();
    }

    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}
