use super::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a streamed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The process ran to completion; `output` holds every line it printed.
    Finished {
        output: String,
        code: Option<i32>,
        success: bool,
    },
    /// Cancellation was requested and the process was stopped.
    Cancelled,
}

impl StreamOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamOutcome::Cancelled)
    }
}

/// Executes bridge commands.
///
/// `capture` is for short-lived queries. `stream` must run off any UI thread:
/// it keeps the process alive until it exits or `cancel` fires.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn capture(&self, args: &[String]) -> BridgeResult<String>;

    async fn stream(
        &self,
        args: &[String],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> BridgeResult<StreamOutcome>;
}

/// Runs the real bridge binary
pub struct AdbRunner {
    program: PathBuf,
    grace: Duration,
}

impl AdbRunner {
    pub fn new(program: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            grace,
        }
    }

    pub fn from_config(config: &crate::utils::Config) -> Self {
        Self::new(config.adb_path.clone(), config.terminate_grace())
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn launch_error(&self, e: std::io::Error) -> BridgeError {
        if e.kind() == std::io::ErrorKind::NotFound {
            BridgeError::NotFound {
                path: self.program.clone(),
            }
        } else {
            BridgeError::Launch {
                reason: e.to_string(),
            }
        }
    }

    /// Graceful stop, then kill once the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        request_stop(child);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Cancelled bridge process stopped: {}", status),
            Ok(Err(e)) => warn!("Error waiting for cancelled bridge process: {}", e),
            Err(_) => {
                warn!(
                    "Bridge process ignored termination for {}, killing",
                    humantime::format_duration(self.grace)
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill bridge process: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl CommandRunner for AdbRunner {
    async fn capture(&self, args: &[String]) -> BridgeResult<String> {
        debug!("Running bridge command: {:?}", args);

        let output = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.launch_error(e))?;

        if !output.status.success() {
            debug!(
                "Bridge command {:?} exited with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stream(
        &self,
        args: &[String],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> BridgeResult<StreamOutcome> {
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }

        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.launch_error(e))?;
        info!("Bridge process {:?} started: {:?}", child.id(), args);

        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Launch {
            reason: "stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BridgeError::Launch {
            reason: "stderr was not captured".to_string(),
        })?;

        // Raw segments instead of `lines()`: device paths are not always UTF-8.
        let mut stdout_reader = BufReader::new(stdout).split(b'\n');
        let mut stderr_reader = BufReader::new(stderr).split(b'\n');
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut output_lines = Vec::new();

        while !(stdout_done && stderr_done) {
            let segment = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancelling bridge command {:?}", args);
                    self.terminate(&mut child).await;
                    return Ok(StreamOutcome::Cancelled);
                }
                segment = stdout_reader.next_segment(), if !stdout_done => {
                    match segment {
                        Ok(Some(bytes)) => Some(bytes),
                        Ok(None) => { stdout_done = true; None }
                        Err(e) => {
                            warn!("Error reading bridge stdout: {}", e);
                            stdout_done = true;
                            None
                        }
                    }
                }
                segment = stderr_reader.next_segment(), if !stderr_done => {
                    match segment {
                        Ok(Some(bytes)) => Some(bytes),
                        Ok(None) => { stderr_done = true; None }
                        Err(e) => {
                            warn!("Error reading bridge stderr: {}", e);
                            stderr_done = true;
                            None
                        }
                    }
                }
            };

            if let Some(bytes) = segment {
                let line = decode_line(&bytes);
                on_line(&line);
                output_lines.push(line);
            }
        }

        let status = child.wait().await?;
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        debug!("Bridge command {:?} finished: {}", args, status);

        Ok(StreamOutcome::Finished {
            output: output_lines.join("\n"),
            code: status.code(),
            success: status.success(),
        })
    }
}

/// Ask `child` to exit: SIGTERM on unix, an outright kill elsewhere.
#[cfg(unix)]
fn request_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

/// Lossy decode with trailing whitespace (including `\r`) removed
pub fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}
