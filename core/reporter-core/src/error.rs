//! Error types for crash-reporter-core operations.

use std::path::PathBuf;

/// All errors that can occur in crash-reporter-core operations.
#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    // ─────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Artifact name does not follow the rich-core convention: {0}")]
    MalformedArtifactName(PathBuf),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid configuration value for {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReporterError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ReporterError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using ReporterError.
pub type Result<T> = std::result::Result<T, ReporterError>;
