//! Storage configuration and path management for crash-reporter.
//!
//! `StorageConfig` is the single place that decides where the config file,
//! IPC sockets, and logs live. Production code uses `StorageConfig::default()`
//! (`~/.crash-reporter`, overridable with `CRASH_REPORTER_HOME`); tests use
//! `StorageConfig::with_root(temp_dir)`.

use std::env;
use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "CRASH_REPORTER_HOME";
const ROOT_DIR_NAME: &str = ".crash-reporter";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        if let Ok(root) = env::var(HOME_ENV) {
            if !root.trim().is_empty() {
                return Self {
                    root: PathBuf::from(root),
                };
            }
        }
        let root = dirs::home_dir()
            .map(|home| home.join(ROOT_DIR_NAME))
            .unwrap_or_else(|| env::temp_dir().join(ROOT_DIR_NAME));
        Self { root }
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to config.toml (operator settings).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Sockets
    // ─────────────────────────────────────────────────────────────────────────────

    /// Control socket served by the monitoring daemon.
    pub fn daemon_socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    /// Socket served by the crash dialog UI.
    pub fn dialog_socket(&self) -> PathBuf {
        self.root.join("dialog.sock")
    }

    /// Socket served by the auto uploader.
    pub fn uploader_socket(&self) -> PathBuf {
        self.root.join("uploader.sock")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
