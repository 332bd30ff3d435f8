//! Crash reporter monitoring daemon.
//!
//! Watches the configured core directories and routes every new rich-core to
//! the dialog UI, the auto uploader, or the bin, depending on the operator's
//! modes. Also serves a small control socket for health checks and mode
//! changes. All state lives on one event loop (see `service`).

use std::env;
use std::sync::{mpsc, Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crash_reporter_core::{load_config, parse_crash_info, ReporterConfig, StorageConfig};

mod collaborators;
mod control;
mod dispatcher;
mod notification;
mod service;
mod watch;

use collaborators::{SocketDialogService, SocketUploader};
use dispatcher::CrashEventDispatcher;
use notification::{DesktopNotifier, DismissalSink};
use service::{DaemonEvent, DaemonService};
use watch::DirectoryWatchRegistry;

const DEBUG_LOG_ENV: &str = "CRASH_REPORTER_DEBUG_LOG";

fn main() {
    init_logging();

    let storage = StorageConfig::default();
    if let Err(err) = fs_err::create_dir_all(storage.root()) {
        error!(error = %err, "Failed to create crash-reporter directory");
        std::process::exit(1);
    }

    let config = match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            ReporterConfig::default()
        }
    };
    info!(
        auto_delete = config.modes.auto_delete,
        auto_upload = config.modes.auto_upload,
        max_similar = config.duplicates.max_similar,
        core_dirs = config.locations.core_dirs.len(),
        "Config loaded"
    );

    let (tx, rx) = mpsc::channel::<DaemonEvent>();

    let registry = match DirectoryWatchRegistry::new(tx.clone(), Some(storage.config_file())) {
        Ok(registry) => registry,
        Err(err) => {
            error!(error = %err, "Failed to initialize file watcher");
            std::process::exit(1);
        }
    };

    let socket_path = storage.daemon_socket();
    let listener = match control::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };
    if let Err(err) = control::spawn(listener, tx.clone(), config.ipc.request_timeout()) {
        error!(error = %err, "Failed to start control socket thread");
        std::process::exit(1);
    }

    let dismissals = tx.clone();
    let on_dismissed: DismissalSink = Arc::new(move |id, how| {
        let _ = dismissals.send(DaemonEvent::NotificationDismissed { id, how });
    });

    let timeout = config.ipc.request_timeout();
    let mut dispatcher = CrashEventDispatcher::new(
        &config,
        Box::new(SocketDialogService::new(storage.dialog_socket(), timeout)),
        Box::new(SocketUploader::new(
            storage.uploader_socket(),
            timeout,
            config.ipc.uploader_command(),
        )),
        Box::new(DesktopNotifier::new(on_dismissed)),
    );

    dispatcher.subscribe(Box::new(|path: &std::path::Path| match parse_crash_info(path) {
        Ok(crash) => info!(
            binary = %crash.binary_name,
            signal = crash.signal_name(),
            pid = crash.pid,
            "Crash reported"
        ),
        Err(_) => info!(path = %path.display(), "Crash reported"),
    }));

    info!(path = %socket_path.display(), "Crash reporter daemon started");
    let mut service = DaemonService::new(storage, config, dispatcher, registry, rx);
    drop(tx);
    service.run();
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
