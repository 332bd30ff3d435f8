use super::transport::{TransferError, TransferEvent, TransferSink, UploadTransport};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Waiting,
    Sending,
    Error,
    Finished,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Error | UploadStatus::Finished | UploadStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Waiting => "Waiting",
            UploadStatus::Sending => "Sending",
            UploadStatus::Error => "Error",
            UploadStatus::Finished => "Finished",
            UploadStatus::Cancelled => "Cancelled",
        }
    }
}

/// What an item tells its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemNotice {
    Progress {
        id: u64,
        percent: u8,
    },
    /// Emitted exactly once per item, when it reaches a terminal status.
    Finished {
        id: u64,
        status: UploadStatus,
        error: Option<String>,
    },
}

/// One artifact's transfer.
///
/// File name and size are captured at construction and never refreshed.
/// Status only moves forward:
///
/// ```text
/// Waiting --start_upload--> Sending --complete--> Finished
///                           Sending --failure---> Error
/// Waiting --cancel--> Cancelled (notice immediately)
/// Sending --cancel--> Cancelled (notice once the transfer resolves)
/// ```
pub struct UploadItem {
    id: u64,
    file_path: PathBuf,
    file_name: String,
    file_size: u64,
    status: UploadStatus,
    error_message: Option<String>,
    progress: u8,
    transport: Option<Box<dyn UploadTransport>>,
    terminal_reported: bool,
}

impl std::fmt::Debug for UploadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadItem")
            .field("id", &self.id)
            .field("file_name", &self.file_name)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .finish()
    }
}

impl UploadItem {
    pub fn new(id: u64, path: &Path) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        tracing::debug!(id, file = %file_name, size = file_size, "New upload item created");

        Self {
            id,
            file_path: path.to_path_buf(),
            file_name,
            file_size,
            status: UploadStatus::Waiting,
            error_message: None,
            progress: 0,
            transport: None,
            terminal_reported: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// True once the terminal notice has been handed out.
    pub fn is_settled(&self) -> bool {
        self.terminal_reported
    }

    /// Opens a session and begins streaming. Only valid from `Waiting`.
    ///
    /// A false return means nothing is in flight; the item is then in
    /// `Error` (or unchanged if it was not waiting) and the owner collects
    /// the terminal notice with [`UploadItem::take_terminal_notice`].
    pub fn start_upload(
        &mut self,
        mut transport: Box<dyn UploadTransport>,
        sink: TransferSink,
    ) -> bool {
        if self.status != UploadStatus::Waiting {
            tracing::warn!(
                id = self.id,
                status = self.status.as_str(),
                "Ignoring start request for item that is not waiting"
            );
            return false;
        }

        tracing::debug!(id = self.id, file = %self.file_name, "Starting upload");

        let started = transport
            .open_session()
            .and_then(|_| transport.begin_transfer(&self.file_path, sink));

        match started {
            Ok(()) => {
                self.transport = Some(transport);
                self.set_status(UploadStatus::Sending);
                true
            }
            Err(err) => {
                self.fail(&err);
                false
            }
        }
    }

    /// Cancels the item. No-op once terminal.
    ///
    /// Returns the terminal notice when it is available right away (the item
    /// was still waiting); a sending item reports once its transfer resolves.
    pub fn cancel(&mut self) -> Option<ItemNotice> {
        tracing::debug!(id = self.id, file = %self.file_name, "Cancel upload");
        match self.status {
            UploadStatus::Waiting => {
                self.set_status(UploadStatus::Cancelled);
                self.take_terminal_notice()
            }
            UploadStatus::Sending => {
                self.set_status(UploadStatus::Cancelled);
                if let Some(transport) = self.transport.as_mut() {
                    transport.abort();
                }
                None
            }
            UploadStatus::Error | UploadStatus::Finished | UploadStatus::Cancelled => None,
        }
    }

    /// Feeds one transport event into the state machine.
    pub fn handle_event(&mut self, event: TransferEvent) -> Option<ItemNotice> {
        if self.terminal_reported || self.transport.is_none() {
            return None;
        }

        match event {
            TransferEvent::Progress(percent) => {
                if self.status != UploadStatus::Sending {
                    return None;
                }
                let percent = percent.min(100);
                if percent <= self.progress {
                    return None;
                }
                self.progress = percent;
                Some(ItemNotice::Progress {
                    id: self.id,
                    percent,
                })
            }
            TransferEvent::Complete => {
                self.progress = 100;
                self.set_status(UploadStatus::Finished);
                self.take_terminal_notice()
            }
            TransferEvent::Failed(err) => {
                if self.status == UploadStatus::Cancelled {
                    self.error_message = Some(err.to_string());
                } else {
                    self.fail(&err);
                }
                self.take_terminal_notice()
            }
            TransferEvent::Aborted => {
                if self.status == UploadStatus::Sending {
                    self.fail(&TransferError::Aborted);
                }
                self.take_terminal_notice()
            }
        }
    }

    /// Hands out the terminal notice, at most once over the item's life.
    pub fn take_terminal_notice(&mut self) -> Option<ItemNotice> {
        if !self.status.is_terminal() || self.terminal_reported {
            return None;
        }
        self.terminal_reported = true;
        self.transport = None;
        Some(ItemNotice::Finished {
            id: self.id,
            status: self.status,
            error: self.error_message.clone(),
        })
    }

    fn fail(&mut self, err: &TransferError) {
        tracing::warn!(id = self.id, file = %self.file_name, error = %err, "Upload failed");
        self.error_message = Some(err.to_string());
        self.set_status(UploadStatus::Error);
    }

    fn set_status(&mut self, status: UploadStatus) {
        tracing::debug!(
            id = self.id,
            from = self.status.as_str(),
            to = status.as_str(),
            "Upload status changed"
        );
        self.status = status;
    }
}
