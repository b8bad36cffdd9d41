pub mod config;
pub mod log_buffer;
pub mod logging;

pub use config::Config;
pub use log_buffer::{LogBuffer, LogEntry, LogLevel};
