//! Scripted command runner for exercising bridge consumers without a device

use super::error::{BridgeError, BridgeResult};
use super::runner::{CommandRunner, StreamOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub enum Reply {
    /// Lines printed before a successful exit
    Lines(Vec<String>),
    /// Lines printed before exiting with `code`
    Exit(Vec<String>, i32),
    /// Block until cancelled
    Hang,
    /// The binary could not be started
    LaunchError,
}

impl Reply {
    pub fn output(text: &str) -> Self {
        Reply::Lines(text.lines().map(str::to_string).collect())
    }

    pub fn empty() -> Self {
        Reply::Lines(Vec::new())
    }
}

type Handler = Box<dyn Fn(&[String]) -> Reply + Send + Sync>;

pub struct ScriptedRunner {
    handler: Handler,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&[String]) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Calls whose arguments contain `needle`
    pub fn calls_with(&self, needle: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|args| args.iter().any(|a| a == needle))
            .cloned()
            .collect()
    }

    fn reply(&self, args: &[String]) -> Reply {
        self.calls.lock().push(args.to_vec());
        (self.handler)(args)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn capture(&self, args: &[String]) -> BridgeResult<String> {
        match self.reply(args) {
            Reply::Lines(lines) | Reply::Exit(lines, _) => {
                let mut text = lines.join("\n");
                if !text.is_empty() {
                    text.push('\n');
                }
                Ok(text)
            }
            Reply::Hang => Ok(String::new()),
            Reply::LaunchError => Err(BridgeError::Launch {
                reason: "scripted launch failure".to_string(),
            }),
        }
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

        let (lines, code) = match self.reply(args) {
            Reply::Lines(lines) => (lines, 0),
            Reply::Exit(lines, code) => (lines, code),
            Reply::Hang => {
                cancel.cancelled().await;
                return Ok(StreamOutcome::Cancelled);
            }
            Reply::LaunchError => {
                return Err(BridgeError::Launch {
                    reason: "scripted launch failure".to_string(),
                })
            }
        };

        for line in &lines {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }
            on_line(line);
            tokio::task::yield_now().await;
        }

        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }

        Ok(StreamOutcome::Finished {
            output: lines.join("\n"),
            code: Some(code),
            success: code == 0,
        })
    }
}
