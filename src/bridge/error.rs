use std::path::PathBuf;
use thiserror::Error;

/// Transport-level failures talking to the bridge binary
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge binary not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to launch bridge command: {reason}")]
    Launch { reason: String },

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge command `{command}` exited with code {code:?}")]
    Exited { command: String, code: Option<i32> },
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
