//! Artifact discovery in the configured core directories.
//!
//! The locator owns two pieces of state: the configured directory list (which
//! may change at runtime when removable storage comes and goes or the operator
//! edits the config), and the set of artifacts already surfaced to the
//! dispatcher. A directory scan only returns artifacts not yet surfaced, one
//! per call, so a caller that keeps scanning drains every new file without
//! losing any.

use crate::naming::{parse_crash_info, validate_core, CrashInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// A crash artifact on disk, as seen at inspection time.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    /// None when the file name does not follow the convention.
    pub info: Option<CrashInfo>,
}

impl Artifact {
    /// Reads metadata for `path`; returns None if the file is gone.
    pub fn inspect(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Some(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            created,
            info: parse_crash_info(path).ok(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ArtifactLocator {
    locations: Vec<PathBuf>,
    surfaced: HashSet<PathBuf>,
}

impl ArtifactLocator {
    pub fn new(locations: Vec<PathBuf>) -> Self {
        Self {
            locations: dedup_preserving_order(locations),
            surfaced: HashSet::new(),
        }
    }

    /// Replaces the configured directories. Returns true when the set changed,
    /// so watchers know to resync.
    pub fn set_locations(&mut self, locations: Vec<PathBuf>) -> bool {
        let locations = dedup_preserving_order(locations);
        if locations == self.locations {
            return false;
        }
        tracing::info!(count = locations.len(), "Core locations updated");
        self.locations = locations;
        true
    }

    /// Directories that may contain artifacts, in configured order.
    /// Missing directories are included; watch registration skips them.
    pub fn watch_directories(&self) -> Vec<PathBuf> {
        self.locations.clone()
    }

    /// Marks every artifact currently in `dir` as already seen.
    ///
    /// Called when a directory starts being watched, so that cores sitting on
    /// freshly mounted storage are not reported as new crashes.
    pub fn prime_directory(&mut self, dir: &Path) -> usize {
        let existing = list_cores(dir);
        let count = existing.len();
        self.surfaced.extend(existing);
        count
    }

    /// Returns one artifact in `dir` that has not been surfaced yet.
    ///
    /// Oldest first (modification time, then name). Surfaced entries for
    /// files that no longer exist are pruned so a re-created name is new again.
    pub fn scan_for_new_artifact(&mut self, dir: &Path) -> Option<PathBuf> {
        let present = list_cores(dir);
        let present_set: HashSet<&PathBuf> = present.iter().collect();
        self.surfaced
            .retain(|path| path.parent() != Some(dir) || present_set.contains(path));

        let found = present
            .into_iter()
            .find(|path| !self.surfaced.contains(path))?;
        self.surfaced.insert(found.clone());
        tracing::debug!(path = %found.display(), "New rich-core found");
        Some(found)
    }

    /// Every artifact currently present in any existing watch directory.
    pub fn collect_all_artifacts(&self) -> Vec<PathBuf> {
        self.locations
            .iter()
            .filter(|dir| dir.is_dir())
            .flat_map(|dir| list_cores(dir))
            .collect()
    }

    /// Pending artifacts with metadata, newest first.
    pub fn pending_artifacts(&self) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self
            .collect_all_artifacts()
            .iter()
            .filter_map(|path| Artifact::inspect(path))
            .collect();
        artifacts.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.path.cmp(&b.path)));
        artifacts
    }

    /// Drops a path from the surfaced set, e.g. after it was deleted.
    pub fn forget(&mut self, path: &Path) {
        self.surfaced.remove(path);
    }
}

/// Valid cores directly inside `dir`, oldest first.
fn list_cores(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut cores: Vec<(SystemTime, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| validate_core(e.path()))
        .map(|e| {
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.into_path())
        })
        .collect();
    cores.sort();
    cores.into_iter().map(|(_, path)| path).collect()
}

fn dedup_preserving_order(locations: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    locations
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}
