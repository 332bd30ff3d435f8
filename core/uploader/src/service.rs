//! The upload loop shared by `serve` and the foreground `upload` command.
//!
//! One thread owns the [`UploadQueue`]. Socket requests and transport events
//! both arrive on its channel, so queue state is never touched concurrently.

use crash_reporter_core::{
    ItemNotice, QueueNotice, QueueSummary, TransferEvent, TransportFactory, UploadQueue,
    UploadStatus,
};
use crash_reporter_protocol::{
    check_version, parse_upload_files, wire, Method, Request, Response, PROTOCOL_VERSION,
};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub enum ServiceEvent {
    Request {
        request: Request,
        reply: Sender<Response>,
    },
    Transfer {
        id: u64,
        event: TransferEvent,
    },
}

pub struct UploadService {
    queue: UploadQueue,
    paths: HashMap<u64, PathBuf>,
    delete_after_upload: bool,
    exit_when_idle: bool,
    echo_progress: bool,
    totals: QueueSummary,
    started_at: Instant,
    events: Sender<ServiceEvent>,
    inbox: Receiver<ServiceEvent>,
}

impl UploadService {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        max_concurrent: usize,
        delete_after_upload: bool,
    ) -> Self {
        let (events, inbox) = mpsc::channel();
        let transfers = events.clone();
        let queue = UploadQueue::new(
            factory,
            max_concurrent,
            Arc::new(move |id: u64, event: TransferEvent| {
                let _ = transfers.send(ServiceEvent::Transfer { id, event });
            }),
        );
        Self {
            queue,
            paths: HashMap::new(),
            delete_after_upload,
            exit_when_idle: false,
            echo_progress: false,
            totals: QueueSummary::default(),
            started_at: Instant::now(),
            events,
            inbox,
        }
    }

    /// Prints per-file progress on stderr; used by the foreground command.
    pub fn echo_progress(mut self) -> Self {
        self.echo_progress = true;
        self
    }

    /// Serves `listener` until a `quit` request has drained the queue.
    pub fn serve(
        mut self,
        listener: UnixListener,
        reply_timeout: Duration,
    ) -> io::Result<QueueSummary> {
        let requests = self.events.clone();
        let server = wire::serve(listener, "uploader-accept", move |request| {
            forward(&requests, request, reply_timeout)
        })?;
        info!(pid = std::process::id(), "Uploader service ready");
        self.run();
        // Let the reply to the final `quit` reach its client.
        if !server.drain(reply_timeout) {
            warn!("Exiting with unanswered uploader connections");
        }
        Ok(self.totals)
    }

    /// Uploads `files` and returns once every one of them has settled.
    pub fn upload_all(mut self, files: &[PathBuf]) -> QueueSummary {
        let (queued, skipped) = self.enqueue(files);
        debug!(queued, skipped, "Foreground upload started");
        self.totals.failed += skipped as u32;
        self.exit_when_idle = true;
        if !self.finished() {
            self.run();
        }
        self.totals
    }

    fn run(&mut self) {
        while !self.finished() {
            self.run_once(Duration::from_secs(60));
        }
        info!(
            finished = self.totals.finished,
            failed = self.totals.failed,
            cancelled = self.totals.cancelled,
            "Uploader done"
        );
    }

    /// Handles at most one event. Returns false when nothing arrived in time.
    pub fn run_once(&mut self, wait: Duration) -> bool {
        match self.inbox.recv_timeout(wait) {
            Ok(ServiceEvent::Request { request, reply }) => {
                let response = self.handle_request(request);
                let _ = reply.send(response);
                true
            }
            Ok(ServiceEvent::Transfer { id, event }) => {
                let notices = self.queue.handle_transfer(id, event);
                self.apply(notices);
                true
            }
            // The service holds a sender itself, so the channel never closes.
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// True once shutdown was requested and every item has settled.
    pub fn finished(&self) -> bool {
        self.exit_when_idle && self.queue.is_idle()
    }

    fn handle_request(&mut self, request: Request) -> Response {
        if let Err(err) = check_version(&request) {
            return Response::error_with_info(request.id, err);
        }
        debug!(method = ?request.method, id = ?request.id, "Uploader request received");

        match request.method {
            Method::GetHealth => {
                let status = if self.exit_when_idle { "stopping" } else { "ok" };
                Response::ok(
                    request.id,
                    json!({
                        "status": status,
                        "pid": std::process::id(),
                        "version": env!("CARGO_PKG_VERSION"),
                        "protocol_version": PROTOCOL_VERSION,
                        "uptime_secs": self.started_at.elapsed().as_secs(),
                        "in_flight": self.queue.in_flight(),
                        "waiting": self.queue.pending(),
                        "queued": self.queue.queued_paths(),
                        "totals": self.totals,
                    }),
                )
            }
            Method::UploadFiles => {
                if self.exit_when_idle {
                    return Response::error(
                        request.id,
                        "shutting_down",
                        "uploader is shutting down",
                    );
                }
                let Some(params) = request.params else {
                    return Response::error(request.id, "invalid_params", "files is required");
                };
                let params = match parse_upload_files(params) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
                let files: Vec<PathBuf> = params.files.iter().map(PathBuf::from).collect();
                let (queued, skipped) = self.enqueue(&files);
                Response::ok(
                    request.id,
                    json!({"accepted": true, "queued": queued, "skipped": skipped}),
                )
            }
            Method::Quit => {
                info!(queued = self.queue.queued_paths().len(), "Quit requested");
                self.exit_when_idle = true;
                let notices = self.queue.cancel_all();
                self.apply(notices);
                Response::ok(
                    request.id,
                    json!({"accepted": true, "in_flight": self.queue.in_flight()}),
                )
            }
            Method::RequestDialog | Method::SetModes | Method::ListArtifacts => Response::error(
                request.id,
                "unsupported_method",
                "method is not served by the uploader",
            ),
        }
    }

    /// Queues the files that exist and are not queued yet, then starts
    /// transfers. Returns (queued, skipped).
    fn enqueue(&mut self, files: &[PathBuf]) -> (usize, usize) {
        let present: Vec<&PathBuf> = files
            .iter()
            .filter(|path| {
                let exists = path.is_file();
                if !exists {
                    warn!(path = %path.display(), "Skipping missing artifact");
                }
                exists
            })
            .collect();
        let ids = self.queue.enqueue(present);
        for id in &ids {
            if let Some(item) = self.queue.item(*id) {
                self.paths.insert(*id, item.file_path().to_path_buf());
            }
        }
        let notices = self.queue.pump();
        self.apply(notices);
        (ids.len(), files.len() - ids.len())
    }

    fn apply(&mut self, notices: Vec<QueueNotice>) {
        for notice in notices {
            match notice {
                QueueNotice::Item(ItemNotice::Progress { id, percent }) => {
                    debug!(id, percent, "Upload progress");
                    if self.echo_progress {
                        if let Some(path) = self.paths.get(&id) {
                            echo(&format!("\r{}: {:>3}%", display_name(path), percent));
                        }
                    }
                }
                QueueNotice::Item(ItemNotice::Finished { id, status, error }) => {
                    let Some(path) = self.paths.remove(&id) else {
                        continue;
                    };
                    self.finish(&path, status, error.as_deref());
                }
                QueueNotice::Idle(summary) => {
                    self.totals.finished += summary.finished;
                    self.totals.failed += summary.failed;
                    self.totals.cancelled += summary.cancelled;
                }
            }
        }
    }

    fn finish(&self, path: &Path, status: UploadStatus, error: Option<&str>) {
        match status {
            UploadStatus::Finished => {
                info!(path = %path.display(), "Upload finished");
                if self.delete_after_upload {
                    match fs_err::remove_file(path) {
                        Ok(()) => debug!(path = %path.display(), "Uploaded artifact removed"),
                        Err(err) => warn!(error = %err, "Failed to remove uploaded artifact"),
                    }
                }
            }
            UploadStatus::Error => {
                warn!(path = %path.display(), error = error.unwrap_or("unknown"), "Upload failed")
            }
            UploadStatus::Cancelled => info!(path = %path.display(), "Upload cancelled"),
            UploadStatus::Waiting | UploadStatus::Sending => {}
        }
        if self.echo_progress {
            let outcome = match (status, error) {
                (UploadStatus::Error, Some(error)) => format!("failed: {}", error),
                _ => status.as_str().to_string(),
            };
            echo(&format!("\r{}: {}\n", display_name(path), outcome));
        }
    }
}

fn forward(events: &Sender<ServiceEvent>, request: Request, reply_timeout: Duration) -> Response {
    let id = request.id.clone();
    let (reply, replies) = mpsc::channel();
    if events.send(ServiceEvent::Request { request, reply }).is_err() {
        return Response::error(id, "shutting_down", "uploader is shutting down");
    }
    replies
        .recv_timeout(reply_timeout)
        .unwrap_or_else(|_| Response::error(id, "busy", "uploader did not answer in time"))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn echo(line: &str) {
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}
