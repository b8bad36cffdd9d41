use super::manifest::{create_unique_dir, session_dir_name, write_manifest};
use super::scanner::{mirror_path, parse_listing, remote_basename, DeepScanRules};
use super::worker::{BackupWorker, PullOutcome};
use super::{BackupRequest, BackupSession, BackupState, SessionReport, SharedState};
use crate::bridge::{adb, CommandRunner};
use crate::utils::{Config, LogBuffer, LogEntry, LogLevel};
use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Runs backup sessions against one bridge.
#[derive(Clone)]
pub struct BackupManager {
    runner: Arc<dyn CommandRunner>,
    config: Arc<Config>,
}

/// Per-session shared state: the cancellation flag, transcript and current state.
///
/// `log_capacity` only bounds the recent view; the report carries every line.
#[derive(Clone)]
pub struct SessionContext {
    pub cancel: CancellationToken,
    pub log_buffer: LogBuffer,
    pub state: SharedState,
}

impl SessionContext {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            cancel: CancellationToken::new(),
            log_buffer: LogBuffer::new(log_capacity),
            state: Arc::new(RwLock::new(BackupState::Init)),
        }
    }

    fn set_state(&self, state: BackupState) {
        debug!("Backup state -> {:?}", state);
        *self.state.write() = state;
    }
}

#[derive(Default)]
struct Progress {
    root: Option<PathBuf>,
    pulled: Vec<String>,
}

impl BackupManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<Config>) -> Self {
        Self { runner, config }
    }

    /// Run the session on its own task and return a handle to observe or cancel it.
    pub fn start(&self, request: BackupRequest) -> BackupHandle {
        let ctx = SessionContext::new(self.config.log_capacity);
        let live = ctx.log_buffer.subscribe();
        let device_id = request.device.id.clone();

        let manager = self.clone();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { manager.run(request, &task_ctx).await });

        BackupHandle {
            ctx,
            runner: self.runner.clone(),
            device_id,
            started: Instant::now(),
            live: Some(live),
            task: Some(task),
        }
    }

    /// Drive one session to a terminal state. Never fails: errors end up in the transcript.
    pub async fn run(&self, request: BackupRequest, ctx: &SessionContext) -> SessionReport {
        let started = Instant::now();
        let mut progress = Progress::default();

        let state = match self.execute(&request, ctx, &mut progress, started).await {
            Ok(state) => state,
            Err(e) => {
                ctx.log_buffer.error(format!("ERROR: {:#}", e));
                BackupState::Failed
            }
        };
        ctx.set_state(state);

        SessionReport {
            success: state == BackupState::Completed,
            state,
            root: progress.root,
            pulled: progress.pulled,
            elapsed: started.elapsed(),
            transcript: ctx.log_buffer.transcript(),
        }
    }

    async fn execute(
        &self,
        request: &BackupRequest,
        ctx: &SessionContext,
        progress: &mut Progress,
        started: Instant,
    ) -> Result<BackupState> {
        ctx.set_state(BackupState::Init);
        request.validate(&self.config)?;

        if ctx.cancel.is_cancelled() {
            return Ok(self.cancelled(ctx));
        }

        ctx.set_state(BackupState::CreatingDirectory);
        let session = self.create_session(request).await?;
        ctx.log_buffer
            .info(format!("Backup directory created: {}", session.root.display()));
        progress.root = Some(session.root.clone());

        let worker = BackupWorker::new(
            self.runner.clone(),
            session.device.id.clone(),
            ctx.cancel.clone(),
            ctx.log_buffer.clone(),
        );

        ctx.set_state(BackupState::PullingSelected);
        for folder in &session.selected_folders {
            match worker.pull_selected(folder, &session.root).await? {
                PullOutcome::Pulled => progress.pulled.push(folder.clone()),
                PullOutcome::Skipped => {}
                outcome => return Ok(self.interrupted(ctx, outcome)),
            }
        }

        if session.deep_scan {
            if ctx.cancel.is_cancelled() {
                return Ok(self.cancelled(ctx));
            }
            ctx.set_state(BackupState::DeepScanning);
            if let Some(outcome) = self.deep_scan(&session, &worker, ctx, progress).await? {
                return Ok(self.interrupted(ctx, outcome));
            }
        }

        self.log_summary(&session.root, started.elapsed(), ctx).await;
        Ok(BackupState::Completed)
    }

    async fn create_session(&self, request: &BackupRequest) -> Result<BackupSession> {
        let created_at = Local::now();
        let name = session_dir_name(
            &request.device.model,
            &request.device.serial,
            &request.job_id,
            &created_at,
        );
        let root = create_unique_dir(&self.config.backup_root, &name).await?;

        let session = BackupSession {
            root,
            device: request.device.clone(),
            technician: request.technician.trim().to_string(),
            job_id: request.job_id.trim().to_string(),
            created_at,
            selected_folders: request.selected_folders.clone(),
            deep_scan: request.deep_scan,
        };
        write_manifest(&session).await?;
        info!("Created backup session at {}", session.root.display());

        Ok(session)
    }

    /// Pull project files found outside the selected folders. Returns the
    /// interruption that stopped it, if any.
    async fn deep_scan(
        &self,
        session: &BackupSession,
        worker: &BackupWorker,
        ctx: &SessionContext,
        progress: &mut Progress,
    ) -> Result<Option<PullOutcome>> {
        let storage_root = self.config.storage_root.as_str();
        ctx.log_buffer.info("Searching for additional project files...");

        let listing =
            adb::list_recursive(self.runner.as_ref(), &session.device.id, storage_root).await?;
        if ctx.cancel.is_cancelled() {
            return Ok(Some(PullOutcome::Cancelled));
        }

        let rules = DeepScanRules {
            storage_root,
            extensions: &self.config.extra_extensions,
            blocked: &self.config.blocked_paths,
            selected: &session.selected_folders,
        };
        let plan = rules.plan(&parse_listing(&listing, storage_root));
        if plan.is_empty() {
            ctx.log_buffer.info("No additional project files found");
            return Ok(None);
        }

        ctx.log_buffer.info(format!(
            "Found {} extra directories and {} files in {}",
            plan.directories.len(),
            plan.root_files.len(),
            storage_root
        ));

        let extras = session.root.join(&self.config.extra_dir_name);
        tokio::fs::create_dir_all(&extras)
            .await
            .with_context(|| format!("Failed to create {}", extras.display()))?;

        for dir in &plan.directories {
            if ctx.cancel.is_cancelled() {
                return Ok(Some(PullOutcome::Cancelled));
            }

            // The bridge recreates the last component itself.
            let mirrored = mirror_path(&extras, storage_root, dir);
            let parent = mirrored.parent().unwrap_or(extras.as_path()).to_path_buf();
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;

            match worker.transfer(dir, &parent).await? {
                PullOutcome::Pulled => progress.pulled.push(dir.clone()),
                PullOutcome::Skipped => {}
                outcome => return Ok(Some(outcome)),
            }
        }

        for file in &plan.root_files {
            if ctx.cancel.is_cancelled() {
                return Ok(Some(PullOutcome::Cancelled));
            }

            let target = extras.join(remote_basename(file));
            match worker.transfer(file, &target).await? {
                PullOutcome::Pulled => progress.pulled.push(file.clone()),
                PullOutcome::Skipped => {}
                outcome => return Ok(Some(outcome)),
            }
        }

        Ok(None)
    }

    fn cancelled(&self, ctx: &SessionContext) -> BackupState {
        ctx.log_buffer.warn("Backup cancelled by user.");
        BackupState::Cancelled
    }

    fn interrupted(&self, ctx: &SessionContext, outcome: PullOutcome) -> BackupState {
        match outcome {
            PullOutcome::Disconnected => {
                ctx.log_buffer
                    .error("Backup failed: the device was disconnected.");
                BackupState::Failed
            }
            _ => self.cancelled(ctx),
        }
    }

    async fn log_summary(&self, root: &Path, elapsed: Duration, ctx: &SessionContext) {
        let walk_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&walk_root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count()
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to count backed up files: {}", e);
            0
        });

        let elapsed = Duration::from_secs(elapsed.as_secs());
        ctx.log_buffer.add_log(
            LogLevel::Success,
            format!(
                "Backup completed successfully in {} ({} files in {})",
                humantime::format_duration(elapsed),
                files,
                root.display()
            ),
            None,
        );
    }
}

/// A running session
pub struct BackupHandle {
    ctx: SessionContext,
    runner: Arc<dyn CommandRunner>,
    device_id: String,
    started: Instant,
    live: Option<broadcast::Receiver<LogEntry>>,
    task: Option<JoinHandle<SessionReport>>,
}

impl BackupHandle {
    /// Request cancellation and tear down the device connection so a
    /// transfer in flight aborts. Only the first call has any effect.
    pub async fn cancel(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        self.ctx.cancel.cancel();

        self.ctx.log_buffer.warn("Cancelling backup...");
        if let Err(e) = adb::disconnect(self.runner.as_ref(), &self.device_id).await {
            warn!("Failed to disconnect {}: {}", self.device_id, e);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    pub fn state(&self) -> BackupState {
        *self.ctx.state.read()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.ctx.log_buffer
    }

    /// Transcript stream starting from the first line of the session.
    ///
    /// Only the first call returns the full stream; later calls see new lines only.
    pub fn subscribe(&mut self) -> broadcast::Receiver<LogEntry> {
        self.live
            .take()
            .unwrap_or_else(|| self.ctx.log_buffer.subscribe())
    }

    /// Wait for the terminal report. A session task that panicked reports failure.
    ///
    /// Safe to use in `select!`; once a report was returned the handle is spent
    /// and further calls report failure immediately.
    pub async fn join(&mut self) -> SessionReport {
        let Some(task) = self.task.as_mut() else {
            return self.failure_report("backup already joined");
        };
        let result = task.await;
        self.task = None;

        match result {
            Ok(report) => report,
            Err(e) => {
                self.ctx
                    .log_buffer
                    .error(format!("CRITICAL ERROR: backup task failed: {}", e));
                *self.ctx.state.write() = BackupState::Failed;
                self.failure_report("backup task failed")
            }
        }
    }

    fn failure_report(&self, reason: &str) -> SessionReport {
        debug!("Reporting failed session: {}", reason);
        SessionReport {
            success: false,
            state: BackupState::Failed,
            root: None,
            pulled: Vec::new(),
            elapsed: self.started.elapsed(),
            transcript: self.ctx.log_buffer.transcript(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{Reply, ScriptedRunner};
    use crate::device::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DEVICES: &str = "List of devices attached\nS1\tdevice\n";

    fn request(folders: &[&str], deep_scan: bool) -> BackupRequest {
        BackupRequest {
            device: Device {
                id: "S1".to_string(),
                model: "TSC7".to_string(),
                manufacturer: "Trimble".to_string(),
                serial: "5634R01234".to_string(),
                android_version: "11".to_string(),
                firmware: "TSC7-2.1".to_string(),
                build_type: "user".to_string(),
                serial_suspicious: false,
            },
            compatible: true,
            job_id: "88".to_string(),
            technician: "ana".to_string(),
            selected_folders: folders.iter().map(|s| s.to_string()).collect(),
            deep_scan,
        }
    }

    fn manager(runner: Arc<ScriptedRunner>) -> (BackupManager, TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            backup_root: tmp.path().join("backups"),
            ..Config::default()
        };
        (BackupManager::new(runner, Arc::new(config)), tmp)
    }

    fn is_pull(args: &[String]) -> bool {
        args.iter().any(|a| a == "pull")
    }

    fn is_find(args: &[String]) -> bool {
        args.iter().any(|a| a.starts_with("find "))
    }

    /// Device `S1` stays connected; every folder except `/sdcard/B` holds a file.
    fn healthy_device(listing: &'static str) -> ScriptedRunner {
        ScriptedRunner::new(move |args| {
            if args[0] == "devices" {
                Reply::output(DEVICES)
            } else if is_find(args) {
                if args.iter().any(|a| a.contains("/sdcard/B")) {
                    Reply::empty()
                } else {
                    Reply::output("/sdcard/x/file.job")
                }
            } else if args.iter().any(|a| a == "ls") {
                Reply::output(listing)
            } else if is_pull(args) {
                Reply::output("1 file pulled.")
            } else {
                Reply::empty()
            }
        })
    }

    #[tokio::test]
    async fn test_selected_folders_with_empty_one_succeeds() {
        let runner = Arc::new(healthy_device(""));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);

        let report = manager.run(request(&["/sdcard/A", "/sdcard/B"], false), &ctx).await;

        assert!(report.success);
        assert_eq!(report.state, BackupState::Completed);
        assert_eq!(report.pulled, vec!["/sdcard/A"]);
        assert!(ctx.log_buffer.contains("Skipping /sdcard/B (empty or missing)"));
        assert!(ctx.log_buffer.contains("Backed up /sdcard/A"));
        assert!(ctx.log_buffer.contains("Backup completed successfully"));

        let root = report.root.unwrap();
        assert!(root.join("backup_info.txt").is_file());
        assert!(root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("TSC7_5634R01234_JOB88_"));
        assert_eq!(runner.calls_with("pull").len(), 1);
    }

    #[tokio::test]
    async fn test_transcript_keeps_every_line() {
        let runner = Arc::new(ScriptedRunner::new(|args| {
            if args[0] == "devices" {
                Reply::output(DEVICES)
            } else if is_find(args) {
                if args.iter().any(|a| a.contains("/sdcard/B")) {
                    Reply::empty()
                } else {
                    Reply::output("/sdcard/A/file.job")
                }
            } else if is_pull(args) {
                Reply::Lines(
                    (0..1200)
                        .map(|i| format!("[{:3}%] file{}.job", i % 100, i))
                        .collect(),
                )
            } else {
                Reply::empty()
            }
        }));
        let (manager, _tmp) = manager(runner);
        let ctx = SessionContext::new(1000);

        let report = manager.run(request(&["/sdcard/B", "/sdcard/A"], false), &ctx).await;

        assert!(report.success);
        assert!(report.transcript.len() > 1200);
        assert_eq!(ctx.log_buffer.get_logs(None).len(), 1000);
        let messages: Vec<&str> = report.transcript.iter().map(|e| e.message.as_str()).collect();
        assert!(messages[0].starts_with("Backup directory created: "));
        assert!(messages.contains(&"Skipping /sdcard/B (empty or missing)"));
        assert!(messages.contains(&"[  0%] file0.job"));
        assert!(messages.contains(&"Backed up /sdcard/A"));
    }

    #[tokio::test]
    async fn test_cancel_before_start_pulls_nothing() {
        let runner = Arc::new(healthy_device(""));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);
        ctx.cancel.cancel();

        let report = manager.run(request(&["/sdcard/A"], true), &ctx).await;

        assert!(!report.success);
        assert_eq!(report.state, BackupState::Cancelled);
        assert!(report.pulled.is_empty());
        assert!(runner.calls_with("pull").is_empty());
        assert!(ctx.log_buffer.contains("Backup cancelled by user."));
    }

    #[tokio::test]
    async fn test_device_change_stops_at_second_folder() {
        let checks = AtomicUsize::new(0);
        let runner = Arc::new(ScriptedRunner::new(move |args| {
            if args[0] == "devices" {
                if checks.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::output(DEVICES)
                } else {
                    Reply::output("List of devices attached\nOTHER\tdevice\n")
                }
            } else if is_find(args) {
                Reply::output("/sdcard/x/file.job")
            } else {
                Reply::empty()
            }
        }));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);

        let report = manager
            .run(request(&["/sdcard/A", "/sdcard/B", "/sdcard/C"], true), &ctx)
            .await;

        assert!(!report.success);
        assert_eq!(report.state, BackupState::Failed);
        assert_eq!(report.pulled, vec!["/sdcard/A"]);
        let pulls = runner.calls_with("pull");
        assert_eq!(pulls.len(), 2);
        assert!(pulls[1].contains(&"/sdcard/B".to_string()));
        assert!(runner.calls_with("ls").is_empty());
        assert!(ctx.log_buffer.contains("interrupted: device disconnected"));
    }

    #[tokio::test]
    async fn test_deep_scan_collects_root_file() {
        let runner = Arc::new(healthy_device("/sdcard:\njob.csv\nnotes.md\n"));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);

        let report = manager.run(request(&[], true), &ctx).await;
        assert!(report.success);

        let extras = report.root.unwrap().join("Directorios extra");
        assert!(extras.is_dir());
        let target = extras.join("job.csv").to_string_lossy().to_string();
        let pulls = runner.calls_with("pull");
        assert_eq!(pulls.len(), 1);
        assert_eq!(
            pulls[0],
            adb::device_args("S1", &["pull", "/sdcard/job.csv", target.as_str()])
        );
    }

    #[tokio::test]
    async fn test_deep_scan_mirrors_directories() {
        let listing = "/sdcard:\n\
                       Foo\n\
                       \n\
                       /sdcard/Foo/Bar:\n\
                       points.DXF\n\
                       \n\
                       /sdcard/Android/data/app:\n\
                       cache.csv\n\
                       \n\
                       /sdcard/A/sub:\n\
                       dup.csv\n";
        let runner = Arc::new(healthy_device(listing));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);

        let report = manager.run(request(&["/sdcard/A"], true), &ctx).await;
        assert!(report.success);
        assert_eq!(report.pulled, vec!["/sdcard/A", "/sdcard/Foo/Bar"]);

        let extras = report.root.unwrap().join("Directorios extra");
        assert!(extras.join("Foo").is_dir());
        let target = extras.join("Foo").to_string_lossy().to_string();
        let pulls = runner.calls_with("pull");
        assert_eq!(pulls.len(), 2);
        assert_eq!(
            pulls[1],
            adb::device_args("S1", &["pull", "/sdcard/Foo/Bar", target.as_str()])
        );
        assert!(!pulls.iter().flatten().any(|a| a.contains("/sdcard/Android")));
    }

    #[tokio::test]
    async fn test_deep_scan_without_matches() {
        let runner = Arc::new(healthy_device("/sdcard/Android/data:\ncache.csv\n"));
        let (manager, _tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);

        let report = manager.run(request(&[], true), &ctx).await;
        assert!(report.success);
        assert!(ctx.log_buffer.contains("No additional project files found"));
        assert!(!report.root.unwrap().join("Directorios extra").exists());
    }

    #[tokio::test]
    async fn test_transport_error_fails_session() {
        let runner = Arc::new(ScriptedRunner::new(|args| {
            if is_find(args) {
                Reply::LaunchError
            } else {
                Reply::output(DEVICES)
            }
        }));
        let (manager, _tmp) = manager(runner);
        let ctx = SessionContext::new(100);

        let report = manager.run(request(&["/sdcard/A"], false), &ctx).await;
        assert!(!report.success);
        assert_eq!(report.state, BackupState::Failed);
        assert!(report.transcript.iter().any(|e| e.message.starts_with("ERROR:")));
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_directory() {
        let runner = Arc::new(healthy_device(""));
        let (manager, tmp) = manager(runner.clone());
        let ctx = SessionContext::new(100);
        let mut req = request(&["/sdcard/A"], false);
        req.technician = " ".to_string();

        let report = manager.run(req, &ctx).await;
        assert!(!report.success);
        assert!(report.root.is_none());
        assert!(!tmp.path().join("backups").exists());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handle_cancel_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::new(|args| {
            if is_pull(args) {
                Reply::Hang
            } else if is_find(args) {
                Reply::output("/sdcard/A/file.job")
            } else {
                Reply::output(DEVICES)
            }
        }));
        let (manager, _tmp) = manager(runner.clone());
        let mut handle = manager.start(request(&["/sdcard/A"], false));
        let mut live = handle.subscribe();

        loop {
            let entry = live.recv().await.unwrap();
            if entry.message.starts_with("Backing up /sdcard/A") {
                break;
            }
        }
        while runner.calls_with("pull").is_empty() {
            tokio::task::yield_now().await;
        }

        handle.cancel().await;
        handle.cancel().await;
        assert!(handle.is_cancelled());

        let report = handle.join().await;
        assert!(!report.success);
        assert_eq!(report.state, BackupState::Cancelled);
        assert_eq!(handle.state(), BackupState::Cancelled);
        assert!(handle.is_finished());
        assert!(handle.log_buffer().contains("Backup cancelled by user."));
        assert_eq!(runner.calls_with("disconnect").len(), 1);
        assert_eq!(
            report
                .transcript
                .iter()
                .filter(|e| e.message == "Cancelling backup...")
                .count(),
            1
        );
        assert!(report
            .transcript
            .iter()
            .any(|e| e.message == "Backup of /sdcard/A cancelled."));
    }

    #[tokio::test]
    async fn test_panicking_session_reports_failure() {
        let runner = Arc::new(ScriptedRunner::new(|args| {
            if is_find(args) {
                panic!("runner exploded");
            }
            Reply::output(DEVICES)
        }));
        let (manager, _tmp) = manager(runner);
        let mut handle = manager.start(request(&["/sdcard/A"], false));

        let report = handle.join().await;
        assert!(!report.success);
        assert_eq!(report.state, BackupState::Failed);
        assert!(report
            .transcript
            .iter()
            .any(|e| e.message.starts_with("CRITICAL ERROR")));
    }
}
