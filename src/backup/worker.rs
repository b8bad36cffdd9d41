use crate::bridge::{adb, BridgeError, CommandRunner, StreamOutcome};
use crate::utils::{LogBuffer, LogLevel};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a single remote transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Pulled,
    /// Empty or missing remote folder
    Skipped,
    Cancelled,
    /// A different device (or none) answered after the transfer
    Disconnected,
}

/// Transfers remote paths of one device into a session root.
pub struct BackupWorker {
    runner: Arc<dyn CommandRunner>,
    device_id: String,
    cancel: CancellationToken,
    log_buffer: LogBuffer,
}

impl BackupWorker {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        device_id: impl Into<String>,
        cancel: CancellationToken,
        log_buffer: LogBuffer,
    ) -> Self {
        Self {
            runner,
            device_id: device_id.into(),
            cancel,
            log_buffer,
        }
    }

    /// Pull one selected folder into `local_root`, skipping it when it holds no files.
    pub async fn pull_selected(&self, remote: &str, local_root: &Path) -> Result<PullOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(PullOutcome::Cancelled);
        }

        self.log_buffer
            .add_log(LogLevel::Info, format!("Backing up {}...", remote), Some(remote));

        let files = adb::list_files(self.runner.as_ref(), &self.device_id, remote).await?;
        if files.is_empty() {
            self.log_buffer.add_log(
                LogLevel::Info,
                format!("Skipping {} (empty or missing)", remote),
                Some(remote),
            );
            return Ok(PullOutcome::Skipped);
        }
        debug!("{} holds {} files", remote, files.len());

        self.transfer(remote, local_root).await
    }

    /// Pull `remote` into `local`, then re-check cancellation and device identity.
    ///
    /// A non-zero exit only becomes an error once both checks passed.
    pub async fn transfer(&self, remote: &str, local: &Path) -> Result<PullOutcome> {
        let log_buffer = &self.log_buffer;
        let mut on_line = |line: &str| {
            if !line.trim().is_empty() {
                log_buffer.add_log(LogLevel::Info, line, Some(remote));
            }
        };

        let outcome = adb::pull(
            self.runner.as_ref(),
            &self.device_id,
            remote,
            local,
            &mut on_line,
            &self.cancel,
        )
        .await?;

        if outcome.is_cancelled() || self.cancel.is_cancelled() {
            self.log_buffer.add_log(
                LogLevel::Warn,
                format!("Backup of {} cancelled.", remote),
                Some(remote),
            );
            return Ok(PullOutcome::Cancelled);
        }

        let connected = adb::connected_device(self.runner.as_ref()).await?;
        if connected.as_deref() != Some(self.device_id.as_str()) {
            self.log_buffer.add_log(
                LogLevel::Warn,
                format!("Backup of {} interrupted: device disconnected.", remote),
                Some(remote),
            );
            return Ok(PullOutcome::Disconnected);
        }

        if let StreamOutcome::Finished {
            success: false,
            code,
            ..
        } = outcome
        {
            return Err(BridgeError::Exited {
                command: format!("pull {}", remote),
                code,
            }
            .into());
        }

        self.log_buffer.add_log(
            LogLevel::Success,
            format!("Backed up {}", remote),
            Some(remote),
        );
        Ok(PullOutcome::Pulled)
    }
}
