//! # crash-reporter-core
//!
//! Shared logic for the crash-reporter daemon and uploader: finding rich-core
//! artifacts, deciding which crashes are repeats, attaching user comments, and
//! moving artifacts to the collection server.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Long-running transfers run on worker
//!   threads and report back through callbacks.
//! - **Single owner**: Locator, detector, and queue state are owned by one
//!   event loop; none of the types here lock internally.
//! - **Graceful degradation**: Missing directories and config files yield
//!   empty or default values, not errors.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crash_reporter_core::{load_config, ArtifactLocator, DuplicateDetector, StorageConfig};
//!
//! let storage = StorageConfig::default();
//! let config = load_config(&storage.config_file())?;
//! let mut locator = ArtifactLocator::new(config.locations.resolved_core_dirs());
//! let mut detector = DuplicateDetector::from_config(&config.duplicates);
//! ```

pub mod artifacts;
pub mod comments;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod naming;
pub mod storage;
pub mod upload;

pub use artifacts::{Artifact, ArtifactLocator};
pub use comments::{append_comment, read_comment};
pub use config::*;
pub use duplicates::{CrashSignature, DuplicateDetector, HandledCrashEntry};
pub use error::{ReporterError, Result};
pub use naming::{format_file_size, parse_crash_info, signal_name, validate_core, CrashInfo};
pub use storage::StorageConfig;
pub use upload::*;
