use super::item::{ItemNotice, UploadItem, UploadStatus};
use super::transport::{TransferEvent, TransferSink, TransportFactory};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Routes a transport event back to the queue owner, tagged with the item id.
pub type EventDispatch = Arc<dyn Fn(u64, TransferEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub finished: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl QueueSummary {
    fn count(&mut self, status: UploadStatus) {
        match status {
            UploadStatus::Finished => self.finished += 1,
            UploadStatus::Error => self.failed += 1,
            UploadStatus::Cancelled => self.cancelled += 1,
            UploadStatus::Waiting | UploadStatus::Sending => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
    Item(ItemNotice),
    /// Every queued item has settled; carries the tally since the last idle.
    Idle(QueueSummary),
}

/// Upload items in arrival order, at most `max_concurrent` sending at once.
///
/// Items leave the queue as soon as their terminal notice is emitted.
pub struct UploadQueue {
    items: Vec<UploadItem>,
    next_id: u64,
    max_concurrent: usize,
    factory: Box<dyn TransportFactory>,
    dispatch: EventDispatch,
    summary: QueueSummary,
}

impl UploadQueue {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        max_concurrent: usize,
        dispatch: EventDispatch,
    ) -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
            max_concurrent: max_concurrent.max(1),
            factory,
            dispatch,
            summary: QueueSummary::default(),
        }
    }

    /// Adds files to the queue and returns the ids assigned. Paths already
    /// queued are skipped. Call [`UploadQueue::pump`] to start transfers.
    pub fn enqueue<I, P>(&mut self, paths: I) -> Vec<u64>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut ids = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if self.contains(path) {
                tracing::debug!(path = %path.display(), "Already queued, skipping");
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.items.push(UploadItem::new(id, path));
            ids.push(id);
        }
        if !ids.is_empty() {
            tracing::info!(added = ids.len(), queued = self.items.len(), "Files queued for upload");
        }
        ids
    }

    /// Starts waiting items until the concurrency limit is reached.
    pub fn pump(&mut self) -> Vec<QueueNotice> {
        let mut notices = Vec::new();
        loop {
            if self.in_flight() >= self.max_concurrent {
                break;
            }
            let Some(index) = self
                .items
                .iter()
                .position(|item| item.status() == UploadStatus::Waiting)
            else {
                break;
            };

            let id = self.items[index].id();
            let dispatch = Arc::clone(&self.dispatch);
            let sink: TransferSink = Arc::new(move |event| dispatch(id, event));
            let transport = self.factory.create();
            if !self.items[index].start_upload(transport, sink) {
                if let Some(notice) = self.items[index].take_terminal_notice() {
                    notices.push(QueueNotice::Item(notice));
                }
            }
        }
        self.settle(notices)
    }

    /// Applies one transport event and starts the next item when a slot frees.
    pub fn handle_transfer(&mut self, id: u64, event: TransferEvent) -> Vec<QueueNotice> {
        let Some(item) = self.items.iter_mut().find(|item| item.id() == id) else {
            tracing::debug!(id, "Event for unknown upload item dropped");
            return Vec::new();
        };

        let Some(notice) = item.handle_event(event) else {
            return Vec::new();
        };
        let terminal = matches!(notice, ItemNotice::Finished { .. });
        let mut notices = vec![QueueNotice::Item(notice)];
        if terminal {
            notices.extend(self.pump());
            return notices;
        }
        notices
    }

    pub fn cancel_all(&mut self) -> Vec<QueueNotice> {
        tracing::info!(queued = self.items.len(), "Cancelling all uploads");
        let notices = self
            .items
            .iter_mut()
            .filter_map(UploadItem::cancel)
            .map(QueueNotice::Item)
            .collect();
        self.settle(notices)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.items.iter().any(|item| item.file_path() == path)
    }

    pub fn in_flight(&self) -> usize {
        self.items
            .iter()
            .filter(|item| !item.is_settled() && item.status() != UploadStatus::Waiting)
            .count()
    }

    pub fn pending(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status() == UploadStatus::Waiting)
            .count()
    }

    pub fn is_idle(&self) -> bool {
        self.items.is_empty()
    }

    pub fn summary(&self) -> QueueSummary {
        self.summary
    }

    pub fn item(&self, id: u64) -> Option<&UploadItem> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn queued_paths(&self) -> Vec<PathBuf> {
        self.items.iter().map(|item| item.file_path().to_path_buf()).collect()
    }

    /// Counts and removes settled items; appends `Idle` when the queue drains.
    fn settle(&mut self, mut notices: Vec<QueueNotice>) -> Vec<QueueNotice> {
        let mut removed = false;
        let summary = &mut self.summary;
        self.items.retain(|item| {
            if item.is_settled() {
                summary.count(item.status());
                removed = true;
                false
            } else {
                true
            }
        });

        if removed && self.items.is_empty() {
            let summary = std::mem::take(&mut self.summary);
            tracing::info!(
                finished = summary.finished,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "Upload queue drained"
            );
            notices.push(QueueNotice::Idle(summary));
        }
        notices
    }
}
