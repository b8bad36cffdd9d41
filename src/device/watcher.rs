use crate::bridge::{CommandRunner, StreamOutcome};
use crate::utils::Config;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frame meaning "no devices attached"
const EMPTY_FRAME: &str = "0000";
/// Width of the hex length header in front of every frame
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(String),
    Disconnected(String),
}

/// Bridge serial of the tracked device, written only by the watcher task
pub type SharedDevice = Arc<RwLock<Option<String>>>;

/// Presence state machine over the `track-devices` frame stream.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    current: Option<String>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Feed one output line, which may hold an empty frame glued to the next one.
    pub fn process_line(&mut self, line: &str) -> Vec<DeviceEvent> {
        split_frames(line)
            .into_iter()
            .filter_map(|frame| self.process_frame(frame))
            .collect()
    }

    pub fn process_frame(&mut self, frame: &str) -> Option<DeviceEvent> {
        let frame = frame.trim();
        if frame.is_empty() {
            return None;
        }

        let body = if frame.len() > HEADER_LEN && frame.is_char_boundary(HEADER_LEN) {
            &frame[HEADER_LEN..]
        } else {
            frame
        };

        if body == EMPTY_FRAME {
            return self.current.take().map(DeviceEvent::Disconnected);
        }

        let parts: Vec<&str> = body.split_whitespace().collect();
        let [serial, status] = parts.as_slice() else {
            debug!("Ignoring malformed tracker frame: {:?}", frame);
            return None;
        };

        match *status {
            "device" if self.current.as_deref() != Some(*serial) => {
                self.current = Some(serial.to_string());
                Some(DeviceEvent::Connected(serial.to_string()))
            }
            "offline" if self.current.as_deref() == Some(*serial) => {
                self.current.take().map(DeviceEvent::Disconnected)
            }
            _ => None,
        }
    }
}

/// Split leading empty frames off a line, since they arrive without a newline.
fn split_frames(line: &str) -> Vec<&str> {
    let mut rest = line.trim();
    let mut frames = Vec::new();
    while rest.len() > HEADER_LEN && rest.starts_with(EMPTY_FRAME) {
        frames.push(EMPTY_FRAME);
        rest = &rest[HEADER_LEN..];
    }
    if !rest.is_empty() {
        frames.push(rest);
    }
    frames
}

/// Runs `track-devices` in the background and reports presence changes.
pub struct DeviceWatcher {
    runner: Arc<dyn CommandRunner>,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl DeviceWatcher {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        let min_backoff = config.watcher_idle();
        Self {
            runner,
            min_backoff,
            max_backoff: config.watcher_restart().max(min_backoff),
        }
    }

    /// Spawn the watcher task. Events arrive on the returned receiver.
    pub fn start(self) -> (WatcherHandle, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let current: SharedDevice = Arc::new(RwLock::new(None));
        let stop = CancellationToken::new();

        let task = tokio::spawn(self.run(current.clone(), event_tx, stop.clone()));

        let handle = WatcherHandle {
            current,
            stop,
            task: Some(task),
        };
        (handle, event_rx)
    }

    async fn run(
        self,
        current: SharedDevice,
        event_tx: mpsc::UnboundedSender<DeviceEvent>,
        stop: CancellationToken,
    ) {
        info!("Device watcher started");
        let args = vec!["track-devices".to_string()];
        let mut tracker = DeviceTracker::new();
        let mut backoff = self.min_backoff;

        while !stop.is_cancelled() {
            let mut saw_output = false;
            let mut on_line = |line: &str| {
                saw_output = true;
                for event in tracker.process_line(line) {
                    *current.write() = tracker.current().map(str::to_string);
                    info!("Device event: {:?}", event);
                    if event_tx.send(event).is_err() {
                        debug!("Device event receiver dropped");
                    }
                }
            };

            match self.runner.stream(&args, &mut on_line, &stop).await {
                Ok(StreamOutcome::Cancelled) => break,
                Ok(StreamOutcome::Finished { code, .. }) => {
                    warn!("Device tracker exited with code {:?}, relaunching", code);
                }
                Err(e) => error!("Device tracker could not run: {}", e),
            }

            backoff = if saw_output {
                self.min_backoff
            } else {
                (backoff * 2).min(self.max_backoff)
            };

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        info!("Device watcher stopped");
    }
}

/// Owner of a running watcher; dropping it stops the task.
pub struct WatcherHandle {
    current: SharedDevice,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Bridge serial of the device currently tracked
    pub fn current(&self) -> Option<String> {
        self.current.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Terminate the tracker subprocess and wait for the task to end.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Device watcher task failed: {}", e);
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
