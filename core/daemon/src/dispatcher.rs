//! Routing policy for newly discovered crash artifacts.
//!
//! For every new artifact the dispatcher decides between deleting it (auto
//! delete on and the crash is a throttled repeat), presenting it to the user
//! through the dialog UI (falling back to a local notification), or handing
//! every pending artifact to the batch uploader (auto upload on).
//!
//! The dispatcher owns the locator, the duplicate history, and the pending
//! fallback notifications. It is driven from the daemon's single event loop,
//! so none of this state is shared.

use crash_reporter_core::{
    parse_crash_info, ArtifactLocator, DuplicateDetector, ModeConfig, ReporterConfig,
};
use crash_reporter_protocol::{DialogKind, DialogRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::collaborators::{BatchUploader, DialogService};
use crate::notification::{Dismissal, LocalNotifier};

const NOTIFICATION_TIMEOUT_SECS: u64 = 10;
const NOTIFICATION_BODY: &str = "Unable to start Crash Reporter UI";

/// What happened to one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Throttled repeat removed from disk.
    Deleted(PathBuf),
    /// Throttled repeat that could not be removed; nothing else was done.
    DeleteFailed(PathBuf),
    Presented(PathBuf),
    /// Dialog UI unavailable; a local notification was shown instead.
    FallbackNotified { path: PathBuf, notification: u64 },
    /// Neither the dialog UI nor the local notification could be shown.
    Unreported(PathBuf),
    UploadRequested { trigger: PathBuf, count: usize },
    UploadFailed { trigger: PathBuf, count: usize },
}

/// Callback fired for every artifact that survives the duplicate check.
pub type ArtifactSubscriber = Box<dyn FnMut(&Path)>;

#[derive(Debug)]
struct PendingNotification {
    path: PathBuf,
    shown_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub auto_delete: bool,
    pub auto_upload: bool,
    pub max_similar: u32,
    pub history_entries: usize,
    pub pending_notifications: usize,
    pub core_dirs: Vec<PathBuf>,
}

pub struct CrashEventDispatcher {
    locator: ArtifactLocator,
    detector: DuplicateDetector,
    modes: ModeConfig,
    dialogs: Box<dyn DialogService>,
    uploader: Box<dyn BatchUploader>,
    notifier: Box<dyn LocalNotifier>,
    subscribers: Vec<ArtifactSubscriber>,
    notifications: HashMap<u64, PendingNotification>,
    next_notification: u64,
}

impl CrashEventDispatcher {
    pub fn new(
        config: &ReporterConfig,
        dialogs: Box<dyn DialogService>,
        uploader: Box<dyn BatchUploader>,
        notifier: Box<dyn LocalNotifier>,
    ) -> Self {
        Self {
            locator: ArtifactLocator::new(config.locations.resolved_core_dirs()),
            detector: DuplicateDetector::from_config(&config.duplicates),
            modes: config.modes,
            dialogs,
            uploader,
            notifier,
            subscribers: Vec::new(),
            notifications: HashMap::new(),
            next_notification: 1,
        }
    }

    /// Registers an observer of the "new artifact" event.
    pub fn subscribe(&mut self, subscriber: ArtifactSubscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn locator_mut(&mut self) -> &mut ArtifactLocator {
        &mut self.locator
    }

    pub fn modes(&self) -> ModeConfig {
        self.modes
    }

    /// Handles a change notification for a watched directory.
    ///
    /// Every new artifact in the directory is dispatched, one at a time, in
    /// the order the locator surfaces them. A directory that vanished is a
    /// no-op.
    pub fn handle_directory_changed(&mut self, dir: &Path) -> Vec<DispatchOutcome> {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Changed directory no longer exists");
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        while let Some(path) = self.locator.scan_for_new_artifact(dir) {
            outcomes.push(self.dispatch(&path));
        }
        outcomes
    }

    /// Applies the routing policy to one artifact.
    pub fn dispatch(&mut self, path: &Path) -> DispatchOutcome {
        debug!(path = %path.display(), "Dispatching rich-core");

        if self.modes.auto_delete && self.detector.should_suppress(path) {
            return match fs_err::remove_file(path) {
                Ok(()) => {
                    info!(path = %path.display(), "Deleted duplicate rich-core");
                    self.locator.forget(path);
                    DispatchOutcome::Deleted(path.to_path_buf())
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "Failed to delete duplicate rich-core"
                    );
                    DispatchOutcome::DeleteFailed(path.to_path_buf())
                }
            };
        }

        for subscriber in &mut self.subscribers {
            subscriber(path);
        }

        if self.modes.auto_upload {
            self.request_batch_upload(path)
        } else {
            self.present(path)
        }
    }

    fn present(&mut self, path: &Path) -> DispatchOutcome {
        let request = DialogRequest {
            dialog: DialogKind::Notify,
            arguments: vec![serde_json::Value::String(path.to_string_lossy().to_string())],
        };
        match self.dialogs.present(&request) {
            Ok(()) => DispatchOutcome::Presented(path.to_path_buf()),
            Err(err) => {
                warn!(error = %err, "Crash Reporter UI unavailable; showing notification");
                self.show_fallback(path)
            }
        }
    }

    fn show_fallback(&mut self, path: &Path) -> DispatchOutcome {
        let binary = parse_crash_info(path)
            .map(|info| info.binary_name)
            .unwrap_or_else(|_| {
                path.file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| "An application".to_string())
            });
        let summary = format!("The application {} crashed.", binary);
        let id = self.next_notification;
        self.next_notification += 1;

        match self.notifier.show(
            id,
            &summary,
            NOTIFICATION_BODY,
            Duration::from_secs(NOTIFICATION_TIMEOUT_SECS),
        ) {
            Ok(()) => {
                self.notifications.insert(
                    id,
                    PendingNotification {
                        path: path.to_path_buf(),
                        shown_at: Instant::now(),
                    },
                );
                DispatchOutcome::FallbackNotified {
                    path: path.to_path_buf(),
                    notification: id,
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to show fallback notification");
                DispatchOutcome::Unreported(path.to_path_buf())
            }
        }
    }

    /// Releases a fallback notification once it was activated or timed out.
    pub fn release_notification(&mut self, id: u64, how: Dismissal) -> bool {
        match self.notifications.remove(&id) {
            Some(pending) => {
                debug!(
                    id,
                    how = ?how,
                    path = %pending.path.display(),
                    open_ms = pending.shown_at.elapsed().as_millis() as u64,
                    "Fallback notification released"
                );
                true
            }
            None => false,
        }
    }

    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    fn request_batch_upload(&mut self, trigger: &Path) -> DispatchOutcome {
        // Batches catch up on anything left behind earlier, not just `trigger`.
        let files = self.locator.collect_all_artifacts();
        let count = files.len();
        match self.uploader.upload_files(&files) {
            Ok(()) => {
                info!(count, "Artifacts handed to auto uploader");
                DispatchOutcome::UploadRequested {
                    trigger: trigger.to_path_buf(),
                    count,
                }
            }
            Err(err) => {
                warn!(count, error = %err, "Failed to start auto uploader");
                DispatchOutcome::UploadFailed {
                    trigger: trigger.to_path_buf(),
                    count,
                }
            }
        }
    }

    pub fn set_auto_delete(&mut self, enabled: bool) {
        if self.modes.auto_delete != enabled {
            info!(enabled, "Auto delete mode changed");
        }
        self.modes.auto_delete = enabled;
    }

    /// Switches auto upload. Turning it off asks a running uploader to quit.
    pub fn set_auto_upload(&mut self, enabled: bool) {
        let was_enabled = self.modes.auto_upload;
        self.modes.auto_upload = enabled;
        if was_enabled == enabled {
            return;
        }
        info!(enabled, "Auto upload mode changed");
        if !enabled {
            debug!("Asking auto uploader to quit");
            if let Err(err) = self.uploader.quit() {
                warn!(error = %err, "Failed to stop auto uploader");
            }
        }
    }

    /// Applies a reloaded config snapshot. Returns true when the core
    /// directory set changed and watches need to be resynchronized.
    pub fn apply_config(&mut self, config: &ReporterConfig) -> bool {
        self.set_auto_delete(config.modes.auto_delete);
        self.set_auto_upload(config.modes.auto_upload);
        self.detector.reconfigure(&config.duplicates);
        self.locator
            .set_locations(config.locations.resolved_core_dirs())
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            auto_delete: self.modes.auto_delete,
            auto_upload: self.modes.auto_upload,
            max_similar: self.detector.max_similar(),
            history_entries: self.detector.len(),
            pending_notifications: self.notifications.len(),
            core_dirs: self.locator.watch_directories(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Default)]
    pub struct Calls {
        pub dialogs: Vec<DialogRequest>,
        pub uploads: Vec<Vec<PathBuf>>,
        pub quits: usize,
        pub notifications: Vec<(u64, String)>,
    }

    pub struct FakeDialogs {
        pub calls: Rc<RefCell<Calls>>,
        pub engaged: bool,
    }

    impl DialogService for FakeDialogs {
        fn present(&self, request: &DialogRequest) -> Result<(), CollaboratorError> {
            self.calls.borrow_mut().dialogs.push(request.clone());
            if self.engaged {
                Ok(())
            } else {
                Err(CollaboratorError::NotRegistered)
            }
        }
    }

    pub struct FakeUploader {
        pub calls: Rc<RefCell<Calls>>,
        pub accept: bool,
    }

    impl BatchUploader for FakeUploader {
        fn upload_files(&self, files: &[PathBuf]) -> Result<(), CollaboratorError> {
            self.calls.borrow_mut().uploads.push(files.to_vec());
            if self.accept {
                Ok(())
            } else {
                Err(CollaboratorError::Declined { peer: "uploader" })
            }
        }

        fn quit(&self) -> Result<(), CollaboratorError> {
            self.calls.borrow_mut().quits += 1;
            Ok(())
        }
    }

    pub struct FakeNotifier {
        pub calls: Rc<RefCell<Calls>>,
        pub works: bool,
    }

    impl LocalNotifier for FakeNotifier {
        fn show(&self, id: u64, summary: &str, _body: &str, _timeout: Duration) -> io::Result<()> {
            if !self.works {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            self.calls
                .borrow_mut()
                .notifications
                .push((id, summary.to_string()));
            Ok(())
        }
    }

    pub struct Fixture {
        pub temp: TempDir,
        pub calls: Rc<RefCell<Calls>>,
        pub dispatcher: CrashEventDispatcher,
    }

    impl Fixture {
        pub fn dir(&self) -> PathBuf {
            self.temp.path().join("cores")
        }

        pub fn write_core(&self, name: &str, size: usize) -> PathBuf {
            let path = self.dir().join(name);
            std::fs::write(&path, vec![0u8; size]).unwrap();
            path
        }
    }

    pub fn fixture(modes: ModeConfig, ui_engaged: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cores");
        std::fs::create_dir_all(&dir).unwrap();

        let mut config = ReporterConfig::default();
        config.modes = modes;
        config.locations.core_dirs = vec![dir];

        let calls = Rc::new(RefCell::new(Calls::default()));
        let dispatcher = CrashEventDispatcher::new(
            &config,
            Box::new(FakeDialogs {
                calls: Rc::clone(&calls),
                engaged: ui_engaged,
            }),
            Box::new(FakeUploader {
                calls: Rc::clone(&calls),
                accept: true,
            }),
            Box::new(FakeNotifier {
                calls: Rc::clone(&calls),
                works: true,
            }),
        );
        Fixture {
            temp,
            calls,
            dispatcher,
        }
    }

    fn modes(auto_delete: bool, auto_upload: bool) -> ModeConfig {
        ModeConfig {
            auto_delete,
            auto_upload,
        }
    }

    #[test]
    fn repeats_beyond_threshold_are_deleted_in_auto_delete_mode() {
        let mut fx = fixture(modes(true, false), true);
        let sizes = [1000, 1020, 980, 1010, 990];
        let mut outcomes = Vec::new();
        for (pid, size) in sizes.iter().enumerate() {
            let path = fx.write_core(&format!("app-1234-11-{}.rcore.lzo", pid + 1), *size);
            outcomes.push(fx.dispatcher.dispatch(&path));
        }

        let deleted: Vec<bool> = outcomes
            .iter()
            .map(|outcome| matches!(outcome, DispatchOutcome::Deleted(_)))
            .collect();
        assert_eq!(deleted, vec![false, false, false, true, true]);
        assert!(!fx.dir().join("app-1234-11-4.rcore.lzo").exists());
        assert!(fx.dir().join("app-1234-11-3.rcore.lzo").exists());
        assert_eq!(fx.calls.borrow().dialogs.len(), 3);
    }

    #[test]
    fn duplicates_are_presented_when_auto_delete_is_off() {
        let mut fx = fixture(modes(false, false), true);
        for pid in 1..=5 {
            let path = fx.write_core(&format!("app-1234-11-{}.rcore", pid), 1000);
            assert!(matches!(
                fx.dispatcher.dispatch(&path),
                DispatchOutcome::Presented(_)
            ));
        }
        assert_eq!(fx.dispatcher.snapshot().history_entries, 0);
    }

    #[test]
    fn directory_change_dispatches_every_new_artifact_with_path_argument() {
        let mut fx = fixture(modes(false, false), true);
        let a = fx.write_core("a-1-11-1.rcore", 10);
        let b = fx.write_core("b-1-6-2.rcore", 10);

        let outcomes = fx.dispatcher.handle_directory_changed(&fx.dir());
        assert_eq!(outcomes.len(), 2);
        assert!(fx.dispatcher.handle_directory_changed(&fx.dir()).is_empty());

        let calls = fx.calls.borrow();
        let mut presented: Vec<String> = calls
            .dialogs
            .iter()
            .map(|request| {
                assert_eq!(request.dialog, DialogKind::Notify);
                request.arguments[0].as_str().unwrap().to_string()
            })
            .collect();
        presented.sort();
        assert_eq!(
            presented,
            vec![a.to_string_lossy().to_string(), b.to_string_lossy().to_string()]
        );
    }

    #[test]
    fn vanished_directory_is_a_noop() {
        let mut fx = fixture(modes(false, false), true);
        let gone = fx.temp.path().join("unmounted");
        assert!(fx.dispatcher.handle_directory_changed(&gone).is_empty());
        assert!(fx.calls.borrow().dialogs.is_empty());
    }

    #[test]
    fn unavailable_ui_falls_back_to_notification_until_dismissed() {
        let mut fx = fixture(modes(false, false), false);
        let path = fx.write_core("viewer-1234-11-42.rcore.lzo", 10);

        let outcome = fx.dispatcher.dispatch(&path);
        let DispatchOutcome::FallbackNotified { notification, .. } = outcome.clone() else {
            panic!("expected fallback, got {:?}", outcome);
        };
        assert_eq!(
            fx.calls.borrow().notifications,
            vec![(notification, "The application viewer crashed.".to_string())]
        );
        assert_eq!(fx.dispatcher.pending_notifications(), 1);

        assert!(fx.dispatcher.release_notification(notification, Dismissal::TimedOut));
        assert!(!fx.dispatcher.release_notification(notification, Dismissal::Activated));
        assert_eq!(fx.dispatcher.pending_notifications(), 0);
    }

    #[test]
    fn failed_fallback_is_unreported_without_pending_entry() {
        let temp = TempDir::new().unwrap();
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut dispatcher = CrashEventDispatcher::new(
            &ReporterConfig::default(),
            Box::new(FakeDialogs {
                calls: Rc::clone(&calls),
                engaged: false,
            }),
            Box::new(FakeUploader {
                calls: Rc::clone(&calls),
                accept: true,
            }),
            Box::new(FakeNotifier {
                calls: Rc::clone(&calls),
                works: false,
            }),
        );
        let path = temp.path().join("app-1-11-1.rcore");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(
            dispatcher.dispatch(&path),
            DispatchOutcome::Unreported(path.clone())
        );
        assert_eq!(dispatcher.pending_notifications(), 0);
    }

    #[test]
    fn auto_upload_sends_whole_backlog_instead_of_dialog() {
        let mut fx = fixture(modes(false, true), true);
        let old = fx.write_core("old-1-11-1.rcore", 10);
        let new = fx.write_core("new-1-11-2.rcore", 10);

        let outcome = fx.dispatcher.dispatch(&new);
        assert_eq!(
            outcome,
            DispatchOutcome::UploadRequested {
                trigger: new.clone(),
                count: 2
            }
        );
        let calls = fx.calls.borrow();
        assert!(calls.dialogs.is_empty());
        let mut sent = calls.uploads[0].clone();
        sent.sort();
        assert_eq!(sent, vec![new, old]);
    }

    #[test]
    fn subscribers_see_surviving_artifacts_only() {
        let mut fx = fixture(modes(true, false), true);
        fx.dispatcher
            .detector
            .reconfigure(&crash_reporter_core::DuplicateConfig {
                max_similar: 1,
                history_capacity: 0,
            });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = Rc::clone(&seen);
        fx.dispatcher.subscribe(Box::new(move |path: &Path| {
            seen_clone.borrow_mut().push(path.to_path_buf())
        }));

        let first = fx.write_core("app-1-11-1.rcore", 100);
        let second = fx.write_core("app-1-11-2.rcore", 100);
        fx.dispatcher.dispatch(&first);
        fx.dispatcher.dispatch(&second);
        assert_eq!(*seen.borrow(), vec![first]);
    }

    #[test]
    fn disabling_auto_upload_sends_one_quit_per_transition() {
        let mut fx = fixture(modes(false, true), true);
        fx.dispatcher.set_auto_upload(false);
        fx.dispatcher.set_auto_upload(false);
        assert_eq!(fx.calls.borrow().quits, 1);

        fx.dispatcher.set_auto_upload(true);
        fx.dispatcher.set_auto_upload(false);
        assert_eq!(fx.calls.borrow().quits, 2);
    }

    #[test]
    fn apply_config_reports_location_changes() {
        let mut fx = fixture(modes(false, false), true);
        let mut config = ReporterConfig::default();
        config.locations.core_dirs = vec![fx.dir()];
        config.modes.auto_delete = true;
        assert!(!fx.dispatcher.apply_config(&config));
        assert!(fx.dispatcher.modes().auto_delete);

        config.locations.core_dirs.push(fx.temp.path().join("sd-card"));
        assert!(fx.dispatcher.apply_config(&config));
        assert_eq!(fx.dispatcher.snapshot().core_dirs.len(), 2);
    }
}
