//! Repeat-crash detection.
//!
//! A crash signature is the binary name, the terminating signal, and the
//! artifact size. Two artifacts match when name and signal are equal and the
//! later size lies inside the ±5% band of the first-seen artifact. The band is
//! fixed when an entry is created and matches are always evaluated against
//! the stored entry, so slowly drifting sizes can chain-match.
//!
//! History is owned by whoever owns the detector (the dispatcher) and lives
//! for the process lifetime. An optional capacity evicts the entry matched
//! least recently.

use crate::config::{DuplicateConfig, DEFAULT_MAX_SIMILAR};
use crate::error::{ReporterError, Result};
use crate::naming::parse_crash_info;
use serde::Serialize;
use std::path::Path;

const BAND_LOWER_PERCENT: u128 = 95;
const BAND_UPPER_PERCENT: u128 = 105;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashSignature {
    binary_name: String,
    signal: i32,
    observed_size: u64,
    lower: u64,
    upper: u64,
}

impl CrashSignature {
    pub fn new(binary_name: impl Into<String>, signal: i32, observed_size: u64) -> Self {
        let size = observed_size as u128;
        Self {
            binary_name: binary_name.into(),
            signal,
            observed_size,
            lower: (size * BAND_LOWER_PERCENT / 100) as u64,
            upper: (size * BAND_UPPER_PERCENT / 100).min(u64::MAX as u128) as u64,
        }
    }

    /// Builds a signature from the artifact's name and current size.
    pub fn from_artifact(path: &Path) -> Result<Self> {
        let info = parse_crash_info(path)?;
        let size = fs_err::metadata(path)
            .map_err(|err| ReporterError::io("reading artifact size", err))?
            .len();
        Ok(Self::new(info.binary_name, info.signal, size))
    }

    /// True when `other` is a repeat of this (stored) signature.
    pub fn matches(&self, other: &CrashSignature) -> bool {
        self.binary_name == other.binary_name
            && self.signal == other.signal
            && other.observed_size >= self.lower
            && other.observed_size <= self.upper
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    pub fn observed_size(&self) -> u64 {
        self.observed_size
    }

    pub fn size_band(&self) -> (u64, u64) {
        (self.lower, self.upper)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandledCrashEntry {
    pub signature: CrashSignature,
    pub repeat_count: u32,
    #[serde(skip)]
    last_matched: u64,
}

#[derive(Debug)]
pub struct DuplicateDetector {
    entries: Vec<HandledCrashEntry>,
    max_similar: u32,
    capacity: Option<usize>,
    clock: u64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIMILAR, None)
    }
}

impl DuplicateDetector {
    pub fn new(max_similar: u32, capacity: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            max_similar: max_similar.max(1),
            capacity: capacity.filter(|c| *c > 0),
            clock: 0,
        }
    }

    pub fn from_config(config: &DuplicateConfig) -> Self {
        Self::new(config.max_similar, config.capacity())
    }

    /// Applies a new threshold/capacity, keeping the history.
    pub fn reconfigure(&mut self, config: &DuplicateConfig) {
        self.max_similar = config.max_similar.max(1);
        self.capacity = config.capacity();
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                self.evict_least_recent();
            }
        }
    }

    /// Decides whether the artifact at `path` should be suppressed.
    ///
    /// Artifacts whose name cannot be parsed never match and are not recorded.
    pub fn should_suppress(&mut self, path: &Path) -> bool {
        match CrashSignature::from_artifact(path) {
            Ok(signature) => self.record(signature),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Skipping duplicate check for artifact"
                );
                false
            }
        }
    }

    /// Records one occurrence of `signature`; returns true once the number
    /// of occurrences of a matching entry exceeds the threshold.
    pub fn record(&mut self, signature: CrashSignature) -> bool {
        self.clock += 1;
        let now = self.clock;

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.signature.matches(&signature))
        {
            entry.repeat_count = entry.repeat_count.saturating_add(1);
            entry.last_matched = now;
            let (lower, upper) = entry.signature.size_band();
            tracing::debug!(
                binary = entry.signature.binary_name(),
                signal = entry.signature.signal(),
                lower,
                upper,
                count = entry.repeat_count,
                "Signature matches handled crash"
            );
            let suppress = entry.repeat_count > self.max_similar;
            if suppress {
                tracing::debug!(
                    binary = entry.signature.binary_name(),
                    "Maximum number of duplicates exceeded"
                );
            }
            return suppress;
        }

        if let Some(capacity) = self.capacity {
            if self.entries.len() >= capacity {
                self.evict_least_recent();
            }
        }

        tracing::debug!(
            binary = signature.binary_name(),
            signal = signature.signal(),
            size = signature.observed_size(),
            "Recording new crash signature"
        );
        self.entries.push(HandledCrashEntry {
            signature,
            repeat_count: 1,
            last_matched: now,
        });
        false
    }

    pub fn entries(&self) -> &[HandledCrashEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_similar(&self) -> u32 {
        self.max_similar
    }

    fn evict_least_recent(&mut self) {
        if let Some(index) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_matched)
            .map(|(index, _)| index)
        {
            let evicted = self.entries.remove(index);
            tracing::debug!(
                binary = evicted.signature.binary_name(),
                "Evicted crash signature from history"
            );
        }
    }
}
