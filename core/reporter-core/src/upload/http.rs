//! Multipart HTTP transport for artifacts.
//!
//! The request body streams the file through a counting reader, which both
//! drives progress events and gives `abort()` a way to stop a transfer that is
//! already on the wire. Once the body is sent, an abort still waits up to
//! `ABORT_GRACE` for the server's answer so an accepted upload is reported as
//! complete, then gives up on the response.

use super::transport::{
    TransferError, TransferEvent, TransferSink, TransportFactory, UploadTransport,
};
use crate::config::UploadConfig;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FORM_FIELD: &str = "file";
const ABORT_GRACE: Duration = Duration::from_secs(2);
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct HttpTransport {
    endpoint: String,
    timeout: Duration,
    client: Option<Client>,
    abort: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            client: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl UploadTransport for HttpTransport {
    fn open_session(&mut self) -> Result<(), TransferError> {
        reqwest::Url::parse(&self.endpoint).map_err(|err| {
            TransferError::Session(format!("invalid endpoint {}: {}", self.endpoint, err))
        })?;

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| TransferError::Session(err.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    fn begin_transfer(&mut self, path: &Path, sink: TransferSink) -> Result<(), TransferError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| TransferError::Session("session not open".to_string()))?;

        let unreadable = |source: io::Error| TransferError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let file = fs_err::File::open(path).map_err(unreadable)?;
        let total = file.metadata().map_err(unreadable)?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let sent = Arc::new(AtomicU64::new(0));
        let reader = ProgressReader {
            inner: file.take(total),
            total,
            sent: Arc::clone(&sent),
            abort: Arc::clone(&self.abort),
            sink: Arc::clone(&sink),
            last_percent: 0,
        };
        let part = Part::reader_with_length(reader, total)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|err| TransferError::Session(err.to_string()))?;
        let form = Form::new().part(FORM_FIELD, part);

        let endpoint = self.endpoint.clone();
        let abort = Arc::clone(&self.abort);
        std::thread::Builder::new()
            .name(format!("upload-{}", file_name))
            .spawn(move || {
                tracing::debug!(file = %file_name, bytes = total, "Transfer started");
                let (done, pending) = mpsc::channel();
                // Detached so an abort does not wait out the client timeout.
                std::thread::spawn(move || {
                    let _ = done.send(client.post(&endpoint).multipart(form).send());
                });
                let result = await_response(&pending, &abort);
                let event = resolve(result, sent.load(Ordering::SeqCst), total, &abort);
                tracing::debug!(file = %file_name, outcome = ?event, "Transfer resolved");
                sink(event);
            })
            .map_err(|err| {
                TransferError::Session(format!("cannot spawn transfer thread: {}", err))
            })?;
        Ok(())
    }

    fn abort(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// Waits for the request to finish. `None` means it was aborted and the
/// server did not answer within `ABORT_GRACE` of the abort.
fn await_response(
    pending: &mpsc::Receiver<reqwest::Result<Response>>,
    abort: &AtomicBool,
) -> Option<reqwest::Result<Response>> {
    let mut aborted_at: Option<Instant> = None;
    loop {
        match pending.recv_timeout(ABORT_POLL_INTERVAL) {
            Ok(result) => return Some(result),
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {
                if abort.load(Ordering::SeqCst) {
                    let since = *aborted_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= ABORT_GRACE {
                        return None;
                    }
                }
            }
        }
    }
}

/// A fully sent body the server accepted is complete even if `abort()` came
/// later. Any other outcome after an abort is reported as `Aborted`.
fn resolve(
    result: Option<reqwest::Result<Response>>,
    sent: u64,
    total: u64,
    abort: &AtomicBool,
) -> TransferEvent {
    let aborted = abort.load(Ordering::SeqCst);
    match result {
        Some(Ok(response)) if response.status().is_success() && sent == total => {
            TransferEvent::Complete
        }
        _ if aborted => TransferEvent::Aborted,
        None => TransferEvent::Aborted,
        Some(Ok(response)) if response.status().is_success() => {
            TransferEvent::Failed(TransferError::Truncated {
                expected: total,
                sent,
            })
        }
        Some(Ok(response)) => TransferEvent::Failed(TransferError::Rejected {
            status: response.status().as_u16(),
        }),
        Some(Err(err)) => TransferEvent::Failed(TransferError::Connect(err.to_string())),
    }
}

struct ProgressReader<R> {
    inner: R,
    total: u64,
    sent: Arc<AtomicU64>,
    abort: Arc<AtomicBool>,
    sink: TransferSink,
    last_percent: u8,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "upload aborted"));
        }
        let n = self.inner.read(buf)?;
        let sent = self.sent.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
        let percent = if self.total == 0 {
            100
        } else {
            (sent.saturating_mul(100) / self.total).min(100) as u8
        };
        if percent > self.last_percent {
            self.last_percent = percent;
            (self.sink)(TransferEvent::Progress(percent));
        }
        Ok(n)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    endpoint: String,
    timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.endpoint.clone(), config.timeout())
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self) -> Box<dyn UploadTransport> {
        Box::new(HttpTransport::new(self.endpoint.clone(), self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn channel_sink() -> (TransferSink, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let sink: TransferSink = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        (sink, rx)
    }

    fn wait_terminal(rx: &mpsc::Receiver<TransferEvent>) -> TransferEvent {
        loop {
            match rx.recv_timeout(Duration::from_secs(10)).expect("transfer resolves") {
                TransferEvent::Progress(_) => continue,
                other => return other,
            }
        }
    }

    /// Accepts one request, reads it fully, answers with `status`.
    fn serve_once(status: &'static str) -> (String, std::thread::JoinHandle<Vec<u8>>) {
        let (endpoint, received, release, handle) = serve_gated(status);
        std::thread::spawn(move || {
            if received.recv().is_ok() {
                let _ = release.send(());
            }
        });
        (endpoint, handle)
    }

    /// Like `serve_once`, but reports when the body has arrived and holds the
    /// reply until `release` fires.
    fn serve_gated(
        status: &'static str,
    ) -> (
        String,
        mpsc::Receiver<()>,
        mpsc::Sender<()>,
        std::thread::JoinHandle<Vec<u8>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/upload", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::channel();
        let (release, release_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            received_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(reply.as_bytes());
            request
        });
        (endpoint, received, release, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let body_len = request.len() - header_end - 4;
        match headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
        {
            Some(expected) => body_len >= expected,
            None => request.ends_with(b"0\r\n\r\n"),
        }
    }

    fn artifact(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("app-1234-11-99.rcore.lzo");
        std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();
        path
    }

    #[test]
    fn successful_post_reports_progress_then_complete() {
        let temp = TempDir::new().unwrap();
        let path = artifact(&temp);
        let (endpoint, server) = serve_once("200 OK");
        let (sink, rx) = channel_sink();

        let mut transport = HttpTransport::new(endpoint, Duration::from_secs(10));
        transport.open_session().unwrap();
        transport.begin_transfer(&path, sink).unwrap();

        let mut saw_full = false;
        let terminal = loop {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                TransferEvent::Progress(100) => saw_full = true,
                TransferEvent::Progress(_) => {}
                other => break other,
            }
        };
        assert!(matches!(terminal, TransferEvent::Complete));
        assert!(saw_full);

        let request = server.join().unwrap();
        let text = String::from_utf8_lossy(&request);
        assert!(text.starts_with("POST /upload"));
        assert!(text.contains("filename=\"app-1234-11-99.rcore.lzo\""));
    }

    #[test]
    fn server_error_status_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = artifact(&temp);
        let (endpoint, server) = serve_once("503 Service Unavailable");
        let (sink, rx) = channel_sink();

        let mut transport = HttpTransport::new(endpoint, Duration::from_secs(10));
        transport.open_session().unwrap();
        transport.begin_transfer(&path, sink).unwrap();

        assert!(matches!(
            wait_terminal(&rx),
            TransferEvent::Failed(TransferError::Rejected { status: 503 })
        ));
        server.join().unwrap();
    }

    #[test]
    fn abort_after_server_accepted_still_completes() {
        let temp = TempDir::new().unwrap();
        let path = artifact(&temp);
        let (endpoint, received, release, server) = serve_gated("200 OK");
        let (sink, rx) = channel_sink();

        let mut transport = HttpTransport::new(endpoint, Duration::from_secs(10));
        transport.open_session().unwrap();
        transport.begin_transfer(&path, sink).unwrap();

        received.recv_timeout(Duration::from_secs(10)).unwrap();
        transport.abort();
        release.send(()).unwrap();

        let terminal = wait_terminal(&rx);
        assert!(
            matches!(terminal, TransferEvent::Complete),
            "accepted upload reported {:?}",
            terminal
        );
        server.join().unwrap();
    }

    #[test]
    fn abort_while_awaiting_response_gives_up_after_grace() {
        let temp = TempDir::new().unwrap();
        let path = artifact(&temp);
        let (endpoint, received, release, server) = serve_gated("200 OK");
        let (sink, rx) = channel_sink();

        let mut transport = HttpTransport::new(endpoint, Duration::from_secs(300));
        transport.open_session().unwrap();
        transport.begin_transfer(&path, sink).unwrap();

        received.recv_timeout(Duration::from_secs(10)).unwrap();
        let aborted_at = Instant::now();
        transport.abort();

        assert!(matches!(wait_terminal(&rx), TransferEvent::Aborted));
        let waited = aborted_at.elapsed();
        assert!(waited >= ABORT_GRACE);
        assert!(waited < ABORT_GRACE + Duration::from_secs(5));

        release.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_fails() {
        let temp = TempDir::new().unwrap();
        let path = artifact(&temp);
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (sink, rx) = channel_sink();

        let endpoint = format!("http://127.0.0.1:{}/upload", port);
        let mut transport = HttpTransport::new(endpoint, Duration::from_secs(5));
        transport.open_session().unwrap();
        transport.begin_transfer(&path, sink).unwrap();

        assert!(matches!(
            wait_terminal(&rx),
            TransferEvent::Failed(TransferError::Connect(_))
        ));
    }

    #[test]
    fn unreadable_file_never_starts() {
        let temp = TempDir::new().unwrap();
        let (sink, _rx) = channel_sink();
        let mut transport = HttpTransport::new("http://127.0.0.1:9/upload", Duration::from_secs(1));
        transport.open_session().unwrap();
        let err = transport
            .begin_transfer(&temp.path().join("gone.rcore"), sink)
            .unwrap_err();
        assert!(matches!(err, TransferError::Unreadable { .. }));
    }

    #[test]
    fn invalid_endpoint_fails_session() {
        let mut transport = HttpTransport::new("not a url", Duration::from_secs(1));
        assert!(matches!(transport.open_session(), Err(TransferError::Session(_))));
    }
}
