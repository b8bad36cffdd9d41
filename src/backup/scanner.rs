//! Parsing of recursive remote listings and deep-scan planning

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A file discovered in a recursive listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTreeEntry {
    pub directory: String,
    pub file: String,
}

impl RemoteTreeEntry {
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.directory.trim_end_matches('/'), self.file)
    }
}

/// Parse `ls -R` output in a single pass.
///
/// Lines ending in `:` switch the current directory, blank lines separate
/// blocks, everything else is a file of the current directory. Files seen
/// before any header belong to `implicit_root`.
pub fn parse_listing(listing: &str, implicit_root: &str) -> Vec<RemoteTreeEntry> {
    let mut current_dir = implicit_root.to_string();
    let mut entries = Vec::new();

    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(dir) = line.strip_suffix(':') {
            current_dir = dir.to_string();
            continue;
        }

        entries.push(RemoteTreeEntry {
            directory: current_dir.clone(),
            file: line.to_string(),
        });
    }

    entries
}

/// Why a listed file was or wasn't scheduled by deep scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Extension not in the allow-list
    Unmatched,
    /// Directly in the storage root; pulled as a single file
    RootFile,
    /// Under a blocked prefix
    Blocked,
    /// Under a folder the user already selected
    AlreadySelected,
    /// Directory is not an absolute path
    NotAbsolute,
    /// Its directory gets pulled
    Directory,
}

/// Directories and root-level files the deep scan will pull, sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeepScanPlan {
    pub directories: BTreeSet<String>,
    pub root_files: BTreeSet<String>,
}

impl DeepScanPlan {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.root_files.is_empty()
    }
}

/// Exclusion rules for deep scan. Checks run in a fixed order: root,
/// block-list, selected folders, absoluteness.
#[derive(Debug, Clone, Copy)]
pub struct DeepScanRules<'a> {
    pub storage_root: &'a str,
    pub extensions: &'a [String],
    pub blocked: &'a [String],
    pub selected: &'a [String],
}

impl<'a> DeepScanRules<'a> {
    pub fn matches_extension(&self, file: &str) -> bool {
        let file = file.to_lowercase();
        self.extensions
            .iter()
            .any(|ext| file.ends_with(&ext.to_lowercase()))
    }

    pub fn classify(&self, entry: &RemoteTreeEntry) -> Classification {
        if !self.matches_extension(&entry.file) {
            return Classification::Unmatched;
        }

        let dir = entry.directory.as_str();
        if dir.trim_end_matches('/') == self.storage_root.trim_end_matches('/') {
            return Classification::RootFile;
        }
        if self.blocked.iter().any(|prefix| dir.starts_with(prefix.as_str())) {
            return Classification::Blocked;
        }
        if self.selected.iter().any(|prefix| dir.starts_with(prefix.as_str())) {
            return Classification::AlreadySelected;
        }
        if !dir.starts_with('/') {
            return Classification::NotAbsolute;
        }
        Classification::Directory
    }

    pub fn plan(&self, entries: &[RemoteTreeEntry]) -> DeepScanPlan {
        let mut plan = DeepScanPlan::default();
        for entry in entries {
            match self.classify(entry) {
                Classification::Directory => {
                    plan.directories.insert(entry.directory.clone());
                }
                Classification::RootFile => {
                    plan.root_files.insert(entry.full_path());
                }
                _ => {}
            }
        }
        plan
    }
}

/// Local mirror of `remote_dir` under `extras`, with the storage root stripped.
pub fn mirror_path(extras: &Path, storage_root: &str, remote_dir: &str) -> PathBuf {
    let root = storage_root.trim_end_matches('/');
    let relative = remote_dir.strip_prefix(root).unwrap_or(remote_dir);

    relative
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(extras.to_path_buf(), |path, component| path.join(component))
}

/// Last component of a remote path.
pub fn remote_basename(remote: &str) -> &str {
    remote.trim_end_matches('/').rsplit('/').next().unwrap_or(remote)
}
