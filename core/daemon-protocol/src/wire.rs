//! Newline-delimited JSON framing over Unix sockets.
//!
//! Every message is one JSON document terminated by `\n`. Readers stop at the
//! first newline and cap the buffer at [`MAX_REQUEST_BYTES`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES};

const READ_CHUNK_SIZE: usize = 4096;
const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out waiting for response")]
    Timeout,

    #[error("I/O error talking to peer: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Reads one framed message. Trailing bytes after the newline are ignored.
pub fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "message exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "message timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read message: {}", err),
                ));
            }
        }
    }

    let body = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "message body was empty"));
    }

    serde_json::from_slice(body).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("message was not valid JSON: {}", err),
        )
    })
}

pub fn write_frame<T: Serialize>(stream: &mut impl Write, message: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, message)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Sends one request and waits at most `timeout` for each read and write.
pub fn call(socket: &Path, request: &Request, timeout: Duration) -> Result<Response, CallError> {
    let mut stream = UnixStream::connect(socket).map_err(|source| CallError::Connect {
        path: socket.display().to_string(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    write_frame(&mut stream, request)?;

    read_frame::<Response>(&mut stream).map_err(|err| match err.code.as_str() {
        "read_timeout" => CallError::Timeout,
        _ => CallError::Malformed(err.message),
    })
}

/// Binds `socket`, replacing a stale socket file left by a previous run.
///
/// Fails with `AddrInUse` when something still answers on the socket.
pub fn bind(socket: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket.exists() {
        if UnixStream::connect(socket).is_ok() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} is served by another process", socket.display()),
            ));
        }
        std::fs::remove_file(socket)?;
    }
    UnixListener::bind(socket)
}

/// Handle to a socket served by [`serve`].
pub struct Server {
    open_connections: Arc<AtomicUsize>,
}

impl Server {
    /// Waits until every accepted connection has written its reply, or
    /// `timeout` passes. Returns true when none are left open.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.open_connections.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        true
    }
}

/// Accepts connections on a background thread, one request per connection.
///
/// Each connection gets its own thread; `handler` must not block forever.
/// Unreadable requests are answered with the framing error without reaching
/// the handler.
pub fn serve<H>(listener: UnixListener, name: &str, handler: H) -> std::io::Result<Server>
where
    H: Fn(Request) -> Response + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let open_connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&open_connections);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let handler = Arc::clone(&handler);
                let counter = Arc::clone(&counter);
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    answer(stream, handler.as_ref());
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        })?;
    Ok(Server { open_connections })
}

fn answer<H: Fn(Request) -> Response>(mut stream: UnixStream, handler: &H) {
    let _ = stream.set_read_timeout(Some(SERVER_READ_TIMEOUT));
    let response = match read_frame::<Request>(&mut stream) {
        Ok(request) => handler(request),
        Err(err) => Response::error_with_info(None, err),
    };
    // The client may have given up already.
    let _ = write_frame(&mut stream, &response);
}
