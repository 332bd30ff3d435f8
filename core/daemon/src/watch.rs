//! Live filesystem watches on the configured core directories.
//!
//! Raw notify events are reduced to two signals on the daemon's event
//! channel: "this directory changed" and "the config file changed". Events are
//! not filtered here; the service ignores directories that are not watched.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::service::DaemonEvent;

pub struct DirectoryWatchRegistry {
    watcher: RecommendedWatcher,
    watched: BTreeSet<PathBuf>,
    config_dir: Option<PathBuf>,
}

impl DirectoryWatchRegistry {
    /// Creates the registry. When `config_file` is given its directory is
    /// watched too, so edits to it arrive as `ConfigChanged`.
    pub fn new(events: Sender<DaemonEvent>, config_file: Option<PathBuf>) -> notify::Result<Self> {
        let config_target = config_file.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "File watch error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for signal in signals_for(&event, config_target.as_deref()) {
                let _ = events.send(signal);
            }
        })?;

        let config_dir = config_file
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf);
        if let Some(dir) = config_dir.as_deref() {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => debug!(dir = %dir.display(), "Watching config directory"),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "Cannot watch config directory")
                }
            }
        }

        Ok(Self {
            watcher,
            watched: BTreeSet::new(),
            config_dir,
        })
    }

    /// Makes the watch set match `dirs`. Directories that do not exist are
    /// skipped. Returns the directories that started being watched.
    pub fn sync(&mut self, dirs: &[PathBuf]) -> Vec<PathBuf> {
        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|dir| !dirs.contains(dir))
            .cloned()
            .collect();
        for dir in stale {
            self.unwatch(&dir);
        }

        let mut added = Vec::new();
        for dir in dirs {
            if self.watched.contains(dir) {
                continue;
            }
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "Core directory does not exist; not watching");
                continue;
            }
            match self.watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(dir = %dir.display(), "Watching core directory");
                    self.watched.insert(dir.clone());
                    added.push(dir.clone());
                }
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "Failed to watch core directory")
                }
            }
        }
        added
    }

    /// Drops the watch of a directory that disappeared. It is picked up again
    /// by the next `sync` once it exists.
    pub fn forget(&mut self, dir: &Path) {
        if self.watched.contains(dir) {
            debug!(dir = %dir.display(), "Watched directory vanished");
            self.unwatch(dir);
        }
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.iter().cloned().collect()
    }

    /// Removes every watch.
    pub fn teardown(&mut self) {
        let dirs: Vec<PathBuf> = self.watched.iter().cloned().collect();
        for dir in dirs {
            self.unwatch(&dir);
        }
        if let Some(dir) = self.config_dir.take() {
            let _ = self.watcher.unwatch(&dir);
        }
    }

    fn unwatch(&mut self, dir: &Path) {
        self.watched.remove(dir);
        if self.config_dir.as_deref() == Some(dir) {
            return;
        }
        // Fails when the directory is already gone, which is fine.
        if let Err(err) = self.watcher.unwatch(dir) {
            debug!(dir = %dir.display(), error = %err, "Unwatch failed");
        }
    }
}

fn signals_for(event: &Event, config_file: Option<&Path>) -> Vec<DaemonEvent> {
    let mut signals = Vec::new();
    let mut config_changed = false;
    for path in &event.paths {
        if config_file.is_some_and(|config| config == path) {
            config_changed = true;
            continue;
        }
        if let Some(parent) = path.parent() {
            signals.push(DaemonEvent::DirectoryChanged(parent.to_path_buf()));
        }
        if matches!(event.kind, EventKind::Remove(_)) {
            signals.push(DaemonEvent::DirectoryChanged(path.clone()));
        }
    }
    if config_changed {
        signals.push(DaemonEvent::ConfigChanged);
    }
    signals
}
