use serde::{Deserialize, Serialize};

/// A remote folder offered for backup and whether it is ticked by default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSpec {
    pub path: String,
    pub selected: bool,
}

impl FolderSpec {
    pub fn new(path: &str, selected: bool) -> Self {
        Self {
            path: path.to_string(),
            selected,
        }
    }

    /// Last path component, used as a short label.
    pub fn label(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// A group of models sharing a default folder set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFamily {
    pub name: String,
    pub model_prefixes: Vec<String>,
    pub folders: Vec<FolderSpec>,
}

impl DeviceFamily {
    pub fn matches(&self, model: &str) -> bool {
        self.model_prefixes.iter().any(|prefix| model.starts_with(prefix.as_str()))
    }

    /// Folders ticked by default, in profile order
    pub fn default_selection(&self) -> Vec<String> {
        self.folders
            .iter()
            .filter(|f| f.selected)
            .map(|f| f.path.clone())
            .collect()
    }
}

/// Classifies model strings against the configured families.
///
/// Families are checked in order; the first match wins.
#[derive(Debug, Clone, Copy)]
pub struct ProfileResolver<'a> {
    families: &'a [DeviceFamily],
}

impl<'a> ProfileResolver<'a> {
    pub fn new(families: &'a [DeviceFamily]) -> Self {
        Self { families }
    }

    /// `None` means the model is not supported; backups stay disabled.
    pub fn resolve(&self, model: &str) -> Option<&'a DeviceFamily> {
        self.families.iter().find(|family| family.matches(model))
    }
}

/// A serial is suspicious when empty, not alphanumeric, or 8 characters or fewer.
///
/// Informational only unless `block_suspicious_serial` is configured.
pub fn is_suspicious_serial(serial: &str) -> bool {
    serial.is_empty()
        || !serial.chars().all(char::is_alphanumeric)
        || serial.chars().count() <= 8
}
