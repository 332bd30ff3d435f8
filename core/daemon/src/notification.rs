//! Best-effort local notification used when the dialog UI cannot be reached.
//!
//! Each notification runs `notify-send --wait` in a child process. A watcher
//! thread reaps the child and reports how the notification went away; the
//! daemon keeps the notification pending until that report arrives.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PROGRAM: &str = "notify-send";
const APP_NAME: &str = "crash-reporter";
const DEFAULT_ACTION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dismissal {
    Activated,
    TimedOut,
}

pub type DismissalSink = Arc<dyn Fn(u64, Dismissal) + Send + Sync>;

pub trait LocalNotifier {
    /// Shows a notification. Exactly one dismissal is reported for `id` once
    /// this returns Ok.
    fn show(&self, id: u64, summary: &str, body: &str, timeout: Duration) -> io::Result<()>;
}

pub struct DesktopNotifier {
    program: String,
    on_dismissed: DismissalSink,
}

impl DesktopNotifier {
    pub fn new(on_dismissed: DismissalSink) -> Self {
        Self::with_program(DEFAULT_PROGRAM, on_dismissed)
    }

    pub fn with_program(program: impl Into<String>, on_dismissed: DismissalSink) -> Self {
        Self {
            program: program.into(),
            on_dismissed,
        }
    }
}

impl LocalNotifier for DesktopNotifier {
    fn show(&self, id: u64, summary: &str, body: &str, timeout: Duration) -> io::Result<()> {
        let child = Command::new(&self.program)
            .arg("--wait")
            .arg(format!("--app-name={}", APP_NAME))
            .arg(format!("--expire-time={}", timeout.as_millis()))
            .arg(format!("--action={}=Open", DEFAULT_ACTION))
            .arg(summary)
            .arg(body)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        debug!(id, summary, "Fallback notification shown");

        let on_dismissed = Arc::clone(&self.on_dismissed);
        thread::Builder::new()
            .name(format!("notification-{}", id))
            .spawn(move || {
                let how = match child.wait_with_output() {
                    Ok(output)
                        if String::from_utf8_lossy(&output.stdout).trim() == DEFAULT_ACTION =>
                    {
                        Dismissal::Activated
                    }
                    Ok(_) => Dismissal::TimedOut,
                    Err(err) => {
                        warn!(id, error = %err, "Failed to reap notification process");
                        Dismissal::TimedOut
                    }
                };
                on_dismissed(id, how);
            })?;
        Ok(())
    }
}
