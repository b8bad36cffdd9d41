use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    pub folder: Option<String>,
}

/// User-facing session messages.
///
/// `buffer` is the bounded recent view; `history` keeps every entry for the
/// final transcript. Every entry is mirrored to `tracing` and broadcast to
/// live subscribers.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    history: Arc<Mutex<Vec<LogEntry>>>,
    max_entries: usize,
    live_tx: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        let (live_tx, _) = broadcast::channel(256);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries.min(1024)))),
            history: Arc::new(Mutex::new(Vec::new())),
            max_entries: max_entries.max(1),
            live_tx,
        }
    }

    pub fn add_log(&self, level: LogLevel, message: impl Into<String>, folder: Option<&str>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level,
            message: message.into(),
            folder: folder.map(str::to_string),
        };

        match level {
            LogLevel::Error => tracing::error!(folder = ?entry.folder, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(folder = ?entry.folder, "{}", entry.message),
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(folder = ?entry.folder, "{}", entry.message)
            }
        }

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.max_entries {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }
        self.history.lock().push(entry.clone());

        // No subscribers is fine.
        let _ = self.live_tx.send(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.add_log(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.add_log(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.add_log(LogLevel::Error, message, None);
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        match limit {
            Some(n) => buffer.iter().skip(buffer.len().saturating_sub(n)).cloned().collect(),
            None => buffer.iter().cloned().collect(),
        }
    }

    /// Every entry since the buffer was created, oldest first.
    pub fn transcript(&self) -> Vec<LogEntry> {
        self.history.lock().clone()
    }

    /// Recent entries rendered as plain lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.buffer.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.history.lock().iter().any(|e| e.message.contains(needle))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live_tx.subscribe()
    }
}
