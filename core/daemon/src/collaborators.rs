//! Requests to the processes the daemon hands crashes off to.
//!
//! The dialog UI and the auto uploader each serve a Unix socket. Every call is
//! a single request/response with a bounded timeout, so a stalled peer delays
//! one dispatch by at most that timeout and never wedges the watch loop.

use crash_reporter_protocol::wire::{self, CallError};
use crash_reporter_protocol::{
    DialogRequest, ErrorInfo, Method, Request, Response, ERROR_CHILD_SIGNALED, MAX_REQUEST_BYTES,
    MAX_UPLOAD_FILES,
};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SPAWN_POLL_INTERVAL_MS: u64 = 50;
/// Room left in each frame for the request envelope around the file list.
const ENVELOPE_RESERVE_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{peer} unreachable: {source}")]
    Unreachable {
        peer: &'static str,
        #[source]
        source: CallError,
    },

    #[error("{peer} returned {code}: {message}")]
    Remote {
        peer: &'static str,
        code: String,
        message: String,
    },

    #[error("{peer} declined the request")]
    Declined { peer: &'static str },

    #[error("Dialog UI is not registered")]
    NotRegistered,

    #[error("Failed to launch uploader {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CollaboratorError {
    fn remote(peer: &'static str, error: ErrorInfo) -> Self {
        CollaboratorError::Remote {
            peer,
            code: error.code,
            message: error.message,
        }
    }
}

/// Presents crash dialogs to the user.
pub trait DialogService {
    /// Ok means a UI was engaged with the request.
    fn present(&self, request: &DialogRequest) -> Result<(), CollaboratorError>;
}

/// Hands artifacts to the batch uploader.
pub trait BatchUploader {
    fn upload_files(&self, files: &[PathBuf]) -> Result<(), CollaboratorError>;
    fn quit(&self) -> Result<(), CollaboratorError>;
}

pub struct SocketDialogService {
    socket: PathBuf,
    timeout: Duration,
}

impl SocketDialogService {
    pub fn new(socket: PathBuf, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Asks the dialog server whether it is up, used when a dialog request
    /// failed ambiguously.
    fn is_registered(&self) -> bool {
        let request = Request::new(Method::GetHealth, make_request_id("health"), None);
        match wire::call(&self.socket, &request, self.timeout) {
            Ok(response) => response.ok,
            Err(err) => {
                debug!(error = %err, "Dialog server health probe failed");
                false
            }
        }
    }
}

impl DialogService for SocketDialogService {
    fn present(&self, dialog: &DialogRequest) -> Result<(), CollaboratorError> {
        let params = serde_json::to_value(dialog).ok();
        let request = Request::new(Method::RequestDialog, make_request_id("dialog"), params);
        debug!(dialog = ?dialog.dialog, socket = %self.socket.display(), "Requesting dialog");

        let failure = match wire::call(&self.socket, &request, self.timeout) {
            Ok(response) if response.accepted() => return Ok(()),
            Ok(Response {
                error: Some(error), ..
            }) => {
                if error.code == ERROR_CHILD_SIGNALED {
                    // UI came up and then died on a signal; it was engaged.
                    debug!("Dialog UI exited on a signal");
                    return Ok(());
                }
                CollaboratorError::remote("dialog server", error)
            }
            Ok(_) => CollaboratorError::Declined {
                peer: "dialog server",
            },
            Err(source) => CollaboratorError::Unreachable {
                peer: "dialog server",
                source,
            },
        };

        warn!(error = %failure, "Dialog request failed");
        if self.is_registered() {
            info!("Dialog UI is registered despite failed request");
            return Ok(());
        }
        Err(CollaboratorError::NotRegistered)
    }
}

pub struct SocketUploader {
    socket: PathBuf,
    timeout: Duration,
    /// Launched with `serve` when the socket is unreachable.
    command: Option<PathBuf>,
}

impl SocketUploader {
    pub fn new(socket: PathBuf, timeout: Duration, command: Option<PathBuf>) -> Self {
        Self {
            socket,
            timeout,
            command,
        }
    }

    fn send(&self, request: &Request) -> Result<Response, CallError> {
        wire::call(&self.socket, request, self.timeout)
    }

    fn spawn_and_wait(&self, command: &Path) -> Result<(), CollaboratorError> {
        info!(command = %command.display(), "Launching uploader on demand");
        let mut child = Command::new(command)
            .arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CollaboratorError::Spawn {
                command: command.display().to_string(),
                source,
            })?;
        thread::spawn(move || match child.wait() {
            Ok(status) => debug!(%status, "Uploader exited"),
            Err(err) => warn!(error = %err, "Failed to reap uploader"),
        });

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            if self.socket.exists() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(SPAWN_POLL_INTERVAL_MS));
        }
        warn!(socket = %self.socket.display(), "Uploader socket did not appear in time");
        Ok(())
    }

    fn upload_batch(&self, files: &[String]) -> Result<(), CollaboratorError> {
        let params = serde_json::json!({ "files": files });
        let request = Request::new(Method::UploadFiles, make_request_id("upload"), Some(params));
        debug!(count = files.len(), "Sending files to uploader");

        let response = match self.send(&request) {
            Ok(response) => response,
            Err(CallError::Connect { .. }) if self.command.is_some() => {
                if let Some(command) = self.command.as_deref() {
                    self.spawn_and_wait(command)?;
                }
                self.send(&request)
                    .map_err(|source| CollaboratorError::Unreachable {
                        peer: "uploader",
                        source,
                    })?
            }
            Err(source) => {
                return Err(CollaboratorError::Unreachable {
                    peer: "uploader",
                    source,
                })
            }
        };

        match response {
            response if response.accepted() => Ok(()),
            Response {
                error: Some(error), ..
            } => Err(CollaboratorError::remote("uploader", error)),
            _ => Err(CollaboratorError::Declined { peer: "uploader" }),
        }
    }
}

impl BatchUploader for SocketUploader {
    fn upload_files(&self, files: &[PathBuf]) -> Result<(), CollaboratorError> {
        let files: Vec<String> = files
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        for batch in split_batches(&files) {
            self.upload_batch(batch)?;
        }
        Ok(())
    }

    fn quit(&self) -> Result<(), CollaboratorError> {
        let request = Request::new(Method::Quit, make_request_id("quit"), None);
        match self.send(&request) {
            Ok(response) if response.ok => Ok(()),
            Ok(Response {
                error: Some(error), ..
            }) => Err(CollaboratorError::remote("uploader", error)),
            Ok(_) => Err(CollaboratorError::Declined { peer: "uploader" }),
            // Nothing running means nothing to stop.
            Err(CallError::Connect { .. }) => Ok(()),
            Err(source) => Err(CollaboratorError::Unreachable {
                peer: "uploader",
                source,
            }),
        }
    }
}

/// Splits a backlog into `upload_files` requests the uploader will accept:
/// at most `MAX_UPLOAD_FILES` paths and one frame per request.
fn split_batches(files: &[String]) -> Vec<&[String]> {
    let budget = MAX_REQUEST_BYTES - ENVELOPE_RESERVE_BYTES;
    let mut batches = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (index, file) in files.iter().enumerate() {
        // Quoted and escaped, plus the separating comma.
        let cost = serde_json::to_string(file).map_or(file.len() * 6, |json| json.len()) + 1;
        if index > start && (index - start == MAX_UPLOAD_FILES || bytes + cost > budget) {
            batches.push(&files[start..index]);
            start = index;
            bytes = 0;
        }
        bytes += cost;
    }
    if start < files.len() {
        batches.push(&files[start..]);
    }
    batches
}

fn make_request_id(prefix: &str) -> String {
    let mut random = rand::thread_rng();
    format!("{}-{}-{:x}", prefix, std::process::id(), random.next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crash_reporter_protocol::DialogKind;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use tempfile::TempDir;

    /// Serves `replies` in order, one per connection, and reports requests.
    fn serve(socket: &Path, replies: Vec<Response>) -> mpsc::Receiver<Request> {
        let listener = UnixListener::bind(socket).unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for reply in replies {
                let (mut stream, _) = listener.accept().unwrap();
                let request: Request = wire::read_frame(&mut stream).unwrap();
                tx.send(request).unwrap();
                wire::write_frame(&mut stream, &reply).unwrap();
            }
        });
        rx
    }

    fn notify_request() -> DialogRequest {
        DialogRequest {
            dialog: DialogKind::Notify,
            arguments: vec![json!("/cores/app-1-11-2.rcore")],
        }
    }

    #[test]
    fn accepted_dialog_is_engaged() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("dialog.sock");
        let requests = serve(&socket, vec![Response::ok(None, json!({"accepted": true}))]);

        let service = SocketDialogService::new(socket, Duration::from_secs(2));
        service.present(&notify_request()).unwrap();

        let request = requests.recv().unwrap();
        assert_eq!(request.method, Method::RequestDialog);
        assert_eq!(
            request.params.unwrap()["arguments"][0],
            json!("/cores/app-1-11-2.rcore")
        );
    }

    #[test]
    fn child_signaled_counts_as_engaged_without_probe() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("dialog.sock");
        let requests = serve(
            &socket,
            vec![Response::error(None, ERROR_CHILD_SIGNALED, "ui died")],
        );

        let service = SocketDialogService::new(socket, Duration::from_secs(2));
        service.present(&notify_request()).unwrap();
        assert_eq!(requests.recv().unwrap().method, Method::RequestDialog);
        assert!(requests.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn remote_error_is_rescued_by_registration_probe() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("dialog.sock");
        let requests = serve(
            &socket,
            vec![
                Response::error(None, "busy", "dialog already open"),
                Response::ok(None, json!({"status": "ok"})),
            ],
        );

        let service = SocketDialogService::new(socket, Duration::from_secs(2));
        service.present(&notify_request()).unwrap();
        assert_eq!(requests.recv().unwrap().method, Method::RequestDialog);
        assert_eq!(requests.recv().unwrap().method, Method::GetHealth);
    }

    #[test]
    fn missing_dialog_server_is_not_registered() {
        let temp = TempDir::new().unwrap();
        let service =
            SocketDialogService::new(temp.path().join("dialog.sock"), Duration::from_millis(200));
        let err = service.present(&notify_request()).unwrap_err();
        assert!(matches!(err, CollaboratorError::NotRegistered));
    }

    #[test]
    fn upload_files_sends_every_path() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("uploader.sock");
        let requests = serve(&socket, vec![Response::ok(None, json!({"accepted": true}))]);

        let uploader = SocketUploader::new(socket, Duration::from_secs(2), None);
        uploader
            .upload_files(&[PathBuf::from("/c/a-1-11-1.rcore"), PathBuf::from("/c/b-1-6-2.rcore")])
            .unwrap();

        let request = requests.recv().unwrap();
        assert_eq!(request.method, Method::UploadFiles);
        assert_eq!(
            request.params.unwrap(),
            json!({"files": ["/c/a-1-11-1.rcore", "/c/b-1-6-2.rcore"]})
        );
    }

    fn backlog(len: usize) -> Vec<PathBuf> {
        (0..len)
            .map(|i| PathBuf::from(format!("/c/app-{}-11-1.rcore", i)))
            .collect()
    }

    #[test]
    fn backlog_over_the_request_cap_is_sent_in_batches() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("uploader.sock");
        let requests = serve(
            &socket,
            vec![
                Response::ok(None, json!({"accepted": true})),
                Response::ok(None, json!({"accepted": true})),
            ],
        );

        let uploader = SocketUploader::new(socket, Duration::from_secs(2), None);
        uploader.upload_files(&backlog(MAX_UPLOAD_FILES + 1)).unwrap();

        let first = requests.recv().unwrap().params.unwrap();
        let second = requests.recv().unwrap().params.unwrap();
        assert_eq!(first["files"].as_array().unwrap().len(), MAX_UPLOAD_FILES);
        assert_eq!(
            second["files"],
            json!([format!("/c/app-{}-11-1.rcore", MAX_UPLOAD_FILES)])
        );
    }

    #[test]
    fn long_paths_split_before_the_frame_limit() {
        let dir = format!("/{}", "d".repeat(4000));
        let files: Vec<String> = (0..600)
            .map(|i| format!("{}/app-{}-11-1.rcore", dir, i))
            .collect();
        let batches = split_batches(&files);

        assert!(batches.len() > 1);
        assert_eq!(batches.iter().map(|batch| batch.len()).sum::<usize>(), files.len());
        for batch in batches {
            let request = Request::new(Method::UploadFiles, "u1", Some(json!({ "files": batch })));
            assert!(serde_json::to_vec(&request).unwrap().len() < MAX_REQUEST_BYTES);
        }
    }

    #[test]
    fn refused_batch_stops_the_backlog() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("uploader.sock");
        let requests = serve(
            &socket,
            vec![Response::error(None, "shutting_down", "uploader is stopping")],
        );

        let uploader = SocketUploader::new(socket, Duration::from_millis(300), None);
        let err = uploader.upload_files(&backlog(MAX_UPLOAD_FILES + 1)).unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Remote { ref code, .. } if code == "shutting_down"
        ));
        assert_eq!(requests.recv().unwrap().method, Method::UploadFiles);
        assert!(requests.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn unreachable_uploader_fails_without_command() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("uploader.sock");
        let uploader = SocketUploader::new(socket, Duration::from_millis(200), None);
        let err = uploader
            .upload_files(&[PathBuf::from("/c/a-1-11-1.rcore")])
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unreachable { .. }));
    }

    #[test]
    fn quit_without_running_uploader_is_ok() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("uploader.sock");
        let uploader = SocketUploader::new(socket, Duration::from_millis(200), None);
        uploader.quit().unwrap();
    }
}
