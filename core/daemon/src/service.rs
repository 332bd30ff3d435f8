//! The daemon's single event loop.
//!
//! Filesystem signals, fallback-notification dismissals, and control socket
//! requests all arrive on one channel and are handled here, one at a time.
//! A directory change is processed to completion before the next event is
//! looked at, so scans never interleave.
//!
//! Change signals are settled briefly before scanning: a core dump is written
//! in many chunks and one scan after the burst is enough.

use crash_reporter_core::{load_config, ReporterConfig, StorageConfig};
use crash_reporter_protocol::{
    check_version, parse_set_modes, Method, Request, Response, PROTOCOL_VERSION,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::{CrashEventDispatcher, DispatchOutcome};
use crate::notification::Dismissal;
use crate::watch::DirectoryWatchRegistry;

/// Missing directories are retried this often, to pick up storage that gets
/// mounted after startup.
const RESYNC_INTERVAL_SECS: u64 = 30;

pub enum DaemonEvent {
    DirectoryChanged(PathBuf),
    ConfigChanged,
    NotificationDismissed { id: u64, how: Dismissal },
    Control {
        request: Request,
        reply: Sender<Response>,
    },
}

pub struct DaemonService {
    storage: StorageConfig,
    config: ReporterConfig,
    dispatcher: CrashEventDispatcher,
    registry: DirectoryWatchRegistry,
    events: Receiver<DaemonEvent>,
    due_dirs: BTreeMap<PathBuf, Instant>,
    config_due: Option<Instant>,
    last_resync: Instant,
    started_at: Instant,
    /// Directories primed on their first watch. A re-armed directory is
    /// scanned instead, so crashes written while it was away get reported.
    primed: HashSet<PathBuf>,
}

impl DaemonService {
    pub fn new(
        storage: StorageConfig,
        config: ReporterConfig,
        dispatcher: CrashEventDispatcher,
        registry: DirectoryWatchRegistry,
        events: Receiver<DaemonEvent>,
    ) -> Self {
        let mut service = Self {
            storage,
            config,
            dispatcher,
            registry,
            events,
            due_dirs: BTreeMap::new(),
            config_due: None,
            last_resync: Instant::now(),
            started_at: Instant::now(),
            primed: HashSet::new(),
        };
        service.resync();
        service
    }

    /// Runs until every event sender is gone.
    pub fn run(&mut self) {
        while self.run_once(self.next_wait()) {}
        info!("Event channel closed; stopping");
        self.registry.teardown();
    }

    /// Waits at most `wait` for one event, handles it, then flushes whatever
    /// became due. Returns false once the channel is disconnected.
    pub fn run_once(&mut self, wait: Duration) -> bool {
        let alive = match self.events.recv_timeout(wait) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        };

        self.flush_due(Instant::now());
        if self.last_resync.elapsed() >= Duration::from_secs(RESYNC_INTERVAL_SECS) {
            self.resync();
        }
        alive
    }

    #[cfg(test)]
    pub fn dispatcher(&self) -> &CrashEventDispatcher {
        &self.dispatcher
    }

    fn next_wait(&self) -> Duration {
        let resync_at = self.last_resync + Duration::from_secs(RESYNC_INTERVAL_SECS);
        let next = self
            .due_dirs
            .values()
            .chain(self.config_due.iter())
            .copied()
            .fold(resync_at, Instant::min);
        next.saturating_duration_since(Instant::now())
    }

    fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::DirectoryChanged(dir) => {
                if self.registry.is_watched(&dir) {
                    let settle = self.config.watch.settle();
                    self.due_dirs
                        .entry(dir)
                        .or_insert_with(|| Instant::now() + settle);
                }
            }
            DaemonEvent::ConfigChanged => {
                let settle = self.config.watch.settle();
                self.config_due.get_or_insert_with(|| Instant::now() + settle);
            }
            DaemonEvent::NotificationDismissed { id, how } => {
                self.dispatcher.release_notification(id, how);
            }
            DaemonEvent::Control { request, reply } => {
                let response = self.handle_control(request);
                let _ = reply.send(response);
            }
        }
    }

    fn flush_due(&mut self, now: Instant) {
        let ready: Vec<PathBuf> = self
            .due_dirs
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(dir, _)| dir.clone())
            .collect();
        for dir in ready {
            self.due_dirs.remove(&dir);
            if !dir.is_dir() {
                self.registry.forget(&dir);
                continue;
            }
            let outcomes = self.dispatcher.handle_directory_changed(&dir);
            log_outcomes(&outcomes);
        }

        if self.config_due.is_some_and(|due| due <= now) {
            self.config_due = None;
            self.reload_config();
        }
    }

    fn reload_config(&mut self) {
        let path = self.storage.config_file();
        let config = match load_config(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "Ignoring invalid config change");
                return;
            }
        };
        if config == self.config {
            return;
        }
        info!(path = %path.display(), "Config reloaded");
        let locations_changed = self.dispatcher.apply_config(&config);
        self.config = config;
        if locations_changed {
            self.resync();
        }
    }

    /// Brings watches in line with the locator. A directory watched for the
    /// first time is primed so artifacts already sitting there are not
    /// reported as new crashes; one that came back is scanned.
    fn resync(&mut self) {
        self.last_resync = Instant::now();
        let dirs = self.dispatcher.locator().watch_directories();
        for dir in self.registry.sync(&dirs) {
            if self.primed.contains(&dir) {
                debug!(dir = %dir.display(), "Core directory re-armed");
                self.due_dirs.entry(dir).or_insert_with(Instant::now);
                continue;
            }
            let existing = self.dispatcher.locator_mut().prime_directory(&dir);
            debug!(dir = %dir.display(), existing, "Core directory primed");
            self.primed.insert(dir);
        }
    }

    fn handle_control(&mut self, request: Request) -> Response {
        if let Err(err) = check_version(&request) {
            return Response::error_with_info(request.id, err);
        }
        debug!(method = ?request.method, id = ?request.id, "Control request received");

        match request.method {
            Method::GetHealth => {
                let snapshot = self.dispatcher.snapshot();
                Response::ok(
                    request.id,
                    json!({
                        "status": "ok",
                        "pid": std::process::id(),
                        "version": env!("CARGO_PKG_VERSION"),
                        "protocol_version": PROTOCOL_VERSION,
                        "uptime_secs": self.started_at.elapsed().as_secs(),
                        "auto_delete": snapshot.auto_delete,
                        "auto_upload": snapshot.auto_upload,
                        "max_similar": snapshot.max_similar,
                        "history_entries": snapshot.history_entries,
                        "pending_notifications": snapshot.pending_notifications,
                        "core_dirs": snapshot.core_dirs,
                        "watched_dirs": self.registry.watched(),
                    }),
                )
            }
            Method::SetModes => {
                let Some(params) = request.params else {
                    return Response::error(
                        request.id,
                        "invalid_params",
                        "auto_delete or auto_upload is required",
                    );
                };
                let modes = match parse_set_modes(params) {
                    Ok(modes) => modes,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
                if let Some(enabled) = modes.auto_delete {
                    self.dispatcher.set_auto_delete(enabled);
                }
                if let Some(enabled) = modes.auto_upload {
                    self.dispatcher.set_auto_upload(enabled);
                }
                let current = self.dispatcher.modes();
                Response::ok(
                    request.id,
                    json!({
                        "auto_delete": current.auto_delete,
                        "auto_upload": current.auto_upload,
                    }),
                )
            }
            Method::ListArtifacts => {
                let artifacts = self.dispatcher.locator().pending_artifacts();
                match serde_json::to_value(&artifacts) {
                    Ok(value) => Response::ok(request.id, value),
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize artifacts: {}", err),
                    ),
                }
            }
            Method::RequestDialog | Method::UploadFiles | Method::Quit => Response::error(
                request.id,
                "unsupported_method",
                "method is not served by the daemon",
            ),
        }
    }
}

fn log_outcomes(outcomes: &[DispatchOutcome]) {
    for outcome in outcomes {
        match outcome {
            DispatchOutcome::Deleted(_)
            | DispatchOutcome::Presented(_)
            | DispatchOutcome::FallbackNotified { .. }
            | DispatchOutcome::UploadRequested { .. } => debug!(?outcome, "Artifact dispatched"),
            DispatchOutcome::DeleteFailed(_)
            | DispatchOutcome::Unreported(_)
            | DispatchOutcome::UploadFailed { .. } => warn!(?outcome, "Artifact not handed off"),
        }
    }
}
