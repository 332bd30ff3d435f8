//! Operator configuration loaded from `config.toml`.
//!
//! The loaded `ReporterConfig` is an immutable snapshot: the daemon builds a
//! new one on reload and hands it to the components that care, instead of
//! components reading a global settings store.

use crate::error::{ReporterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_SIMILAR: u32 = 3;
const DEFAULT_SYSTEM_CORE_DIR: &str = "/var/cache/core-dumps";
const DEFAULT_ENDPOINT: &str = "https://crash-reports.invalid/upload";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReporterConfig {
    #[serde(default)]
    pub modes: ModeConfig,
    #[serde(default)]
    pub duplicates: DuplicateConfig,
    #[serde(default)]
    pub locations: LocationConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModeConfig {
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub auto_upload: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DuplicateConfig {
    #[serde(default = "default_max_similar")]
    pub max_similar: u32,
    /// Zero keeps every signature for the life of the process.
    #[serde(default)]
    pub history_capacity: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            max_similar: default_max_similar(),
            history_capacity: 0,
        }
    }
}

impl DuplicateConfig {
    pub fn capacity(&self) -> Option<usize> {
        (self.history_capacity > 0).then_some(self.history_capacity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    #[serde(default = "default_core_dirs")]
    pub core_dirs: Vec<PathBuf>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            core_dirs: default_core_dirs(),
        }
    }
}

impl LocationConfig {
    /// Core directories with a leading `~/` expanded.
    pub fn resolved_core_dirs(&self) -> Vec<PathBuf> {
        self.core_dirs.iter().map(|dir| expand_home(dir)).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

impl WatchConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub delete_after_upload: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_upload_timeout_secs(),
            delete_after_upload: true,
        }
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IpcConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Spawned on demand when the uploader socket is not reachable.
    #[serde(default)]
    pub uploader_command: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            uploader_command: String::new(),
        }
    }
}

impl IpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn uploader_command(&self) -> Option<PathBuf> {
        let trimmed = self.uploader_command.trim();
        (!trimmed.is_empty()).then(|| expand_home(Path::new(trimmed)))
    }
}

impl ReporterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.duplicates.max_similar == 0 {
            return Err(ReporterError::ConfigInvalid {
                field: "duplicates.max_similar".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload.max_concurrent == 0 {
            return Err(ReporterError::ConfigInvalid {
                field: "upload.max_concurrent".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let endpoint = self.upload.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ReporterError::ConfigInvalid {
                field: "upload.endpoint".to_string(),
                reason: format!("expected an http(s) URL, got {:?}", endpoint),
            });
        }
        if self.ipc.request_timeout_ms == 0 {
            return Err(ReporterError::ConfigInvalid {
                field: "ipc.request_timeout_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads the config, returning defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<ReporterConfig> {
    if !path.exists() {
        return Ok(ReporterConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| ReporterError::io(format!("reading {}", path.display()), err))?;
    let config: ReporterConfig =
        toml::from_str(&content).map_err(|err| ReporterError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Writes the config atomically (temp file + rename).
pub fn save_config(path: &Path, config: &ReporterConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|err| ReporterError::io("creating config directory", err))?;
    }
    let content = toml::to_string_pretty(config).map_err(|err| ReporterError::ConfigInvalid {
        field: "config".to_string(),
        reason: err.to_string(),
    })?;
    let tmp_path = path.with_extension("tmp");
    fs_err::write(&tmp_path, content).map_err(|err| ReporterError::io("writing config", err))?;
    fs_err::rename(&tmp_path, path).map_err(|err| ReporterError::io("committing config", err))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn default_max_similar() -> u32 {
    DEFAULT_MAX_SIMILAR
}

fn default_core_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from(DEFAULT_SYSTEM_CORE_DIR),
        PathBuf::from("~/MyDocs/core-dumps"),
    ]
}

fn default_settle_ms() -> u64 {
    250
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_max_concurrent() -> usize {
    1
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}
