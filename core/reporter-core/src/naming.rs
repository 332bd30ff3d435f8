//! Rich-core file naming convention.
//!
//! Artifacts are named `<binary>-<device>-<signal>-<pid>.rcore[.lzo]`, where
//! `<device>` is a short device identifier fragment (the last digits of the
//! IMEI on phones). The binary name may itself contain dashes, so the three
//! trailing fields are matched from the right.

use crate::error::{ReporterError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::Path;

pub const RICH_CORE_SUFFIX: &str = ".rcore";
pub const COMPRESSED_RICH_CORE_SUFFIX: &str = ".rcore.lzo";

/// Binaries whose own crashes are never reported, to avoid feedback loops.
const OWN_BINARY_PREFIX: &str = "crash-reporter";

pub static RE_RICH_CORE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<app>.+)-(?P<device>[0-9A-Za-z]*)-(?P<signal>\d{1,3})-(?P<pid>\d{1,10})",
        r"\.rcore(?:\.lzo)?$"
    ))
    .unwrap()
});

/// The four fields encoded in an artifact name, in convention order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashInfo {
    pub binary_name: String,
    pub device_fragment: String,
    pub signal: i32,
    pub pid: u32,
}

impl CrashInfo {
    pub fn signal_name(&self) -> &'static str {
        signal_name(self.signal)
    }
}

/// Parses crash details out of an artifact path.
pub fn parse_crash_info(path: &Path) -> Result<CrashInfo> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ReporterError::MalformedArtifactName(path.to_path_buf()))?;

    let caps = RE_RICH_CORE_NAME
        .captures(file_name)
        .ok_or_else(|| ReporterError::MalformedArtifactName(path.to_path_buf()))?;

    let signal = caps["signal"]
        .parse::<i32>()
        .map_err(|_| ReporterError::MalformedArtifactName(path.to_path_buf()))?;
    let pid = caps["pid"]
        .parse::<u32>()
        .map_err(|_| ReporterError::MalformedArtifactName(path.to_path_buf()))?;

    Ok(CrashInfo {
        binary_name: caps["app"].to_string(),
        device_fragment: caps["device"].to_string(),
        signal,
        pid,
    })
}

/// Decides whether a file is an artifact this system should act on.
///
/// Accepts `.rcore` and `.rcore.lzo` names, rejects hidden files (partially
/// written dumps) and cores of the crash reporter's own binaries.
pub fn validate_core(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };

    if file_name.starts_with('.') {
        return false;
    }

    if !(file_name.ends_with(RICH_CORE_SUFFIX) || file_name.ends_with(COMPRESSED_RICH_CORE_SUFFIX))
    {
        return false;
    }

    !file_name.starts_with(OWN_BINARY_PREFIX)
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        31 => "SIGSYS",
        _ => "unknown signal",
    }
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_file_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    if size < 1024 {
        return format!("{} B", size);
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
