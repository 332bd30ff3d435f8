//! Operator subcommands that do not run the upload loop.

use chrono::Local;
use crash_reporter_core::{
    append_comment, format_file_size, Artifact, ArtifactLocator, ReporterConfig, ReporterError,
};
use crash_reporter_protocol::wire::{call, CallError};
use crash_reporter_protocol::{Method, Request};
use rand::RngCore;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Reporter(#[from] ReporterError),

    #[error("Uploader unreachable: {0}")]
    Unreachable(#[from] CallError),

    #[error("Uploader refused the request: {code}: {message}")]
    Refused { code: String, message: String },

    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

/// Appends `text` as a user comment. Returns the bytes appended; zero when
/// the comment was blank.
pub fn comment(path: &Path, text: &str) -> Result<u64, CommandError> {
    Ok(append_comment(path, text)?)
}

/// Writes the pending artifacts of every configured location, newest first.
pub fn list(config: &ReporterConfig, out: &mut impl Write) -> Result<usize, CommandError> {
    let locator = ArtifactLocator::new(config.locations.resolved_core_dirs());
    let artifacts = locator.pending_artifacts();
    for artifact in &artifacts {
        writeln!(out, "{}", list_line(artifact))?;
    }
    Ok(artifacts.len())
}

fn list_line(artifact: &Artifact) -> String {
    let (app, pid, signal) = match &artifact.info {
        Some(info) => (
            info.binary_name.as_str(),
            info.pid.to_string(),
            info.signal_name(),
        ),
        None => ("?", "-".to_string(), "-"),
    };
    let created = artifact
        .created
        .map(|created| {
            created
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:>7} {:<8} {:>9}  {}  {}",
        app,
        pid,
        signal,
        format_file_size(artifact.size),
        created,
        artifact.path.display()
    )
}

/// Asks a running uploader to stop. Returns false when none is running.
pub fn quit(socket: &Path, timeout: Duration) -> Result<bool, CommandError> {
    let request = Request::new(Method::Quit, make_request_id("quit"), None);
    let response = match call(socket, &request, timeout) {
        Ok(response) => response,
        Err(CallError::Connect { .. }) => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    match response.error {
        Some(error) if !response.ok => Err(CommandError::Refused {
            code: error.code,
            message: error.message,
        }),
        _ => Ok(true),
    }
}

fn make_request_id(prefix: &str) -> String {
    let mut random = rand::thread_rng();
    format!("{}-{}-{:x}", prefix, std::process::id(), random.next_u64())
}
