use crash_reporter_protocol::wire::call;
use crash_reporter_protocol::{Method, Request, Response};
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_crash-reporter-uploader");

struct UploaderGuard {
    child: Child,
}

impl Drop for UploaderGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn command(root: &Path) -> Command {
    let mut command = Command::new(BIN);
    command.env("CRASH_REPORTER_HOME", root).env("HOME", root);
    command
}

fn run(root: &Path, args: &[&str]) -> Output {
    command(root).args(args).output().expect("run uploader")
}

fn write_config(root: &Path, cores: &Path, endpoint: &str) {
    let config = format!(
        "[locations]\ncore_dirs = [\"{}\"]\n\n[upload]\nendpoint = \"{}\"\ntimeout_secs = 10\n",
        cores.display(),
        endpoint
    );
    std::fs::write(root.join("config.toml"), config).expect("write config");
}

fn setup() -> (TempDir, PathBuf) {
    let root = TempDir::new().expect("temp root");
    let cores = root.path().join("cores");
    std::fs::create_dir_all(&cores).expect("cores dir");
    (root, cores)
}

/// Answers `count` HTTP requests with 200 once each body has arrived.
fn accept_uploads(count: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind http");
    let endpoint = format!("http://{}/upload", listener.local_addr().expect("addr"));
    thread::spawn(move || {
        for _ in 0..count {
            let Ok((mut stream, _)) = listener.accept() else { return };
            let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
            let mut request = Vec::new();
            let mut chunk = [0u8; 8192];
            while !request_complete(&request) {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        }
    });
    endpoint
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

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(25));
    }
    false
}

fn request(socket: &Path, method: Method, params: Option<serde_json::Value>) -> Response {
    let request = Request::new(method, "cli", params);
    call(socket, &request, Duration::from_secs(2)).expect("uploader call")
}

#[test]
fn list_prints_pending_artifacts() {
    let (root, cores) = setup();
    write_config(root.path(), &cores, "http://127.0.0.1:9/upload");
    std::fs::write(cores.join("viewer-1234-11-4242.rcore.lzo"), vec![0u8; 100]).expect("core");

    let output = run(root.path(), &["list"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.contains("viewer"));
    assert!(stdout.contains("SIGSEGV"));
    assert!(stdout.contains("100 B"));
}

#[test]
fn comment_appends_to_artifact() {
    let (root, cores) = setup();
    let core = cores.join("viewer-1234-11-4242.rcore");
    std::fs::write(&core, b"core").expect("core");

    let output = run(root.path(), &["comment", core.to_str().expect("utf8"), "it froze first"]);
    assert!(output.status.success());
    assert!(std::fs::metadata(&core).expect("metadata").len() > 4);

    let missing = run(root.path(), &["comment", "/nonexistent/app-1-11-1.rcore", "hi"]);
    assert!(!missing.status.success());
}

#[test]
fn quit_without_service_succeeds() {
    let (root, cores) = setup();
    write_config(root.path(), &cores, "http://127.0.0.1:9/upload");
    let output = run(root.path(), &["quit"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not running"));
}

#[test]
fn foreground_upload_reports_failure_for_missing_file() {
    let (root, cores) = setup();
    let endpoint = accept_uploads(1);
    write_config(root.path(), &cores, &endpoint);
    let core = cores.join("viewer-1234-11-4242.rcore");
    std::fs::write(&core, vec![1u8; 4096]).expect("core");

    let output = run(
        root.path(),
        &["upload", core.to_str().expect("utf8"), "/nonexistent/app-1-11-1.rcore"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 uploaded, 1 failed"));
    assert!(!core.exists(), "uploaded artifact is deleted by default");
}

#[test]
fn serve_uploads_requested_files_then_quits() {
    let (root, cores) = setup();
    let endpoint = accept_uploads(2);
    write_config(root.path(), &cores, &endpoint);
    let first = cores.join("viewer-1234-11-1.rcore");
    let second = cores.join("viewer-1234-11-2.rcore");
    std::fs::write(&first, vec![1u8; 2048]).expect("core");
    std::fs::write(&second, vec![2u8; 2048]).expect("core");

    let socket = root.path().join("uploader.sock");
    let mut guard = UploaderGuard {
        child: command(root.path())
            .arg("serve")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn serve"),
    };
    assert!(wait_until(Duration::from_secs(5), || socket.exists()), "socket never appeared");

    let health = request(&socket, Method::GetHealth, None);
    assert_eq!(health.data.expect("health")["status"], "ok");

    let response = request(
        &socket,
        Method::UploadFiles,
        Some(json!({"files": [&first, &second]})),
    );
    assert!(response.accepted());
    assert!(
        wait_until(Duration::from_secs(10), || !first.exists() && !second.exists()),
        "uploaded artifacts should be removed"
    );

    let output = run(root.path(), &["quit"]);
    assert!(output.status.success());
    assert!(
        wait_until(Duration::from_secs(5), || matches!(guard.child.try_wait(), Ok(Some(_)))),
        "serve did not exit after quit"
    );
    assert!(!socket.exists());
}
