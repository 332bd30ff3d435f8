use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Why a transfer attempt failed. The display text becomes the item's
/// error message.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Could not open upload session: {0}")]
    Session(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Server rejected upload with HTTP status {status}")]
    Rejected { status: u16 },

    #[error("Transfer truncated: sent {sent} of {expected} bytes")]
    Truncated { expected: u64, sent: u64 },

    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer aborted")]
    Aborted,
}

/// Asynchronous outcome reports from a running transfer.
#[derive(Debug)]
pub enum TransferEvent {
    /// Percentage of the file handed to the wire, 0..=100.
    Progress(u8),
    Complete,
    Failed(TransferError),
    /// The transfer stopped because `abort()` was called.
    Aborted,
}

/// Callback a transport uses to report events from its worker thread.
pub type TransferSink = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// One upload session for one file.
pub trait UploadTransport: Send {
    fn open_session(&mut self) -> Result<(), TransferError>;

    /// Starts streaming `path` and returns immediately. An `Err` means the
    /// transfer never started and no events will follow.
    fn begin_transfer(&mut self, path: &Path, sink: TransferSink) -> Result<(), TransferError>;

    /// Asks a running transfer to stop. Idempotent; the transfer reports
    /// `Aborted` (or its natural outcome if it already finished) afterwards.
    fn abort(&mut self);
}

pub trait TransportFactory: Send {
    fn create(&self) -> Box<dyn UploadTransport>;
}
