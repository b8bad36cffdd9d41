pub mod adb;
pub mod error;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BridgeError, BridgeResult};
pub use runner::{AdbRunner, CommandRunner, StreamOutcome};
