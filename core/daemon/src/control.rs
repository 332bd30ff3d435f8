//! Control socket: forwards requests into the event loop and writes back its
//! reply.

use crash_reporter_protocol::wire;
use crash_reporter_protocol::Response;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::time::Duration;
use tracing::debug;

use crate::service::DaemonEvent;

pub fn bind(socket: &Path) -> io::Result<UnixListener> {
    wire::bind(socket)
}

/// Serves the control socket on a background thread for as long as the
/// listener lives. `reply_timeout` bounds how long a client waits on the
/// event loop.
pub fn spawn(
    listener: UnixListener,
    events: Sender<DaemonEvent>,
    reply_timeout: Duration,
) -> io::Result<wire::Server> {
    wire::serve(listener, "control-accept", move |request| {
        let id = request.id.clone();
        let (reply, replies) = mpsc::channel();
        if events.send(DaemonEvent::Control { request, reply }).is_err() {
            return Response::error(id, "shutting_down", "daemon is shutting down");
        }
        match replies.recv_timeout(reply_timeout) {
            Ok(response) => response,
            Err(_) => {
                debug!(id = ?id, "Event loop did not answer in time");
                Response::error(id, "busy", "daemon did not answer in time")
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crash_reporter_protocol::wire::call;
    use crash_reporter_protocol::{Method, Request};
    use serde_json::json;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn requests_round_trip_through_the_event_channel() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("daemon.sock");
        let listener = bind(&socket).unwrap();
        let (tx, rx) = mpsc::channel();
        spawn(listener, tx, Duration::from_secs(2)).unwrap();

        let loop_thread = thread::spawn(move || match rx.recv().unwrap() {
            DaemonEvent::Control { request, reply } => {
                assert_eq!(request.method, Method::GetHealth);
                reply.send(Response::ok(request.id, json!({"status": "ok"}))).unwrap();
            }
            _ => panic!("expected a control event"),
        });

        let response = call(
            &socket,
            &Request::new(Method::GetHealth, "h1", None),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(response.ok);
        assert_eq!(response.id.as_deref(), Some("h1"));
        loop_thread.join().unwrap();
    }

    #[test]
    fn stalled_loop_answers_busy() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("daemon.sock");
        let listener = bind(&socket).unwrap();
        let (tx, _rx) = mpsc::channel();
        spawn(listener, tx, Duration::from_millis(100)).unwrap();

        let response = call(
            &socket,
            &Request::new(Method::GetHealth, "h2", None),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(response.error.unwrap().code, "busy");
    }

    #[test]
    fn stopped_loop_answers_shutting_down() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("daemon.sock");
        let listener = bind(&socket).unwrap();
        let (tx, rx) = mpsc::channel();
        drop(rx);
        spawn(listener, tx, Duration::from_secs(1)).unwrap();

        let response = call(
            &socket,
            &Request::new(Method::GetHealth, "h3", None),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(response.error.unwrap().code, "shutting_down");
    }
}
