pub mod profile;
pub mod watcher;

pub use profile::{DeviceFamily, FolderSpec, ProfileResolver};
pub use watcher::{DeviceEvent, DeviceTracker, DeviceWatcher, WatcherHandle};

use crate::bridge::{adb, BridgeResult, CommandRunner};
use serde::Serialize;
use tracing::info;

/// An attached data collector, replaced wholesale on every detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Bridge serial used to address the device
    pub id: String,
    pub model: String,
    pub manufacturer: String,
    /// Hardware serial reported by the device
    pub serial: String,
    pub android_version: String,
    pub firmware: String,
    pub build_type: String,
    pub serial_suspicious: bool,
}

/// Outcome of classifying a freshly connected device
#[derive(Debug, Clone)]
pub struct DetectedDevice {
    pub device: Device,
    pub family: Option<DeviceFamily>,
}

impl DetectedDevice {
    pub fn is_compatible(&self) -> bool {
        self.family.is_some()
    }
}

/// Query and classify the device behind `serial`.
pub async fn detect(
    runner: &dyn CommandRunner,
    resolver: ProfileResolver<'_>,
    serial: &str,
) -> BridgeResult<DetectedDevice> {
    let device = adb::device_info(runner, serial).await?;
    let family = resolver.resolve(&device.model).cloned();

    match &family {
        Some(f) => info!(
            "Detected {} {} (serial {}, Android {}) as {}",
            device.manufacturer, device.model, device.serial, device.android_version, f.name
        ),
        None => info!("Device {} ({}) is not compatible", serial, device.model),
    }

    Ok(DetectedDevice { device, family })
}

/// Remembers the last detection so repeated connect events skip re-querying.
#[derive(Debug, Default)]
pub struct Detector {
    last: Option<DetectedDevice>,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect `serial`. Returns `None` when it is the compatible device already detected.
    pub async fn on_connected(
        &mut self,
        runner: &dyn CommandRunner,
        resolver: ProfileResolver<'_>,
        serial: &str,
    ) -> BridgeResult<Option<DetectedDevice>> {
        let unchanged = self
            .last
            .as_ref()
            .is_some_and(|d| d.device.id == serial && d.is_compatible());
        if unchanged {
            return Ok(None);
        }

        let detected = detect(runner, resolver, serial).await?;
        self.last = Some(detected.clone());
        Ok(Some(detected))
    }

    pub fn on_disconnected(&mut self, serial: &str) {
        if self.last.as_ref().is_some_and(|d| d.device.id == serial) {
            self.last = None;
        }
    }

    pub fn current(&self) -> Option<&DetectedDevice> {
        self.last.as_ref()
    }
}
