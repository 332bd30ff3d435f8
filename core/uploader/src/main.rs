//! crash-reporter-uploader: sends crash artifacts to the collection endpoint.
//!
//! ## Subcommands
//!
//! - `serve`: Batch upload service the daemon hands artifacts to
//! - `upload`: Upload files in the foreground, progress on stderr
//! - `comment`: Append a user comment to an artifact
//! - `list`: Print pending artifacts
//! - `quit`: Ask a running `serve` to stop

mod commands;
mod logging;
mod service;

use clap::{Parser, Subcommand};
use crash_reporter_core::{load_config, HttpTransportFactory, ReporterConfig, StorageConfig};
use crash_reporter_protocol::wire;
use service::UploadService;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "crash-reporter-uploader")]
#[command(about = "Crash artifact uploader")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve upload requests on the uploader socket until told to quit
    Serve,

    /// Upload artifacts now and wait for them to finish
    Upload {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Append a user comment to an artifact
    Comment {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// List pending artifacts, newest first
    List,

    /// Stop a running uploader service
    Quit,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let storage = StorageConfig::default();
    let _logging_guard = logging::init(&storage);
    let config = match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load config; using defaults");
            ReporterConfig::default()
        }
    };

    let socket = storage.uploader_socket();
    match cli.command {
        Commands::Serve => serve(&storage, &config),
        Commands::Upload { files } => {
            let summary = upload_service(&config).echo_progress().upload_all(&files);
            eprintln!(
                "{} uploaded, {} failed, {} cancelled",
                summary.finished, summary.failed, summary.cancelled
            );
            if summary.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Commands::Comment { file, text } => match commands::comment(&file, &text) {
            Ok(0) => {
                eprintln!("Comment is empty; nothing appended");
                ExitCode::SUCCESS
            }
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "comment failed");
                ExitCode::FAILURE
            }
        },
        Commands::List => match commands::list(&config, &mut std::io::stdout().lock()) {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "list failed");
                ExitCode::FAILURE
            }
        },
        Commands::Quit => match commands::quit(&socket, config.ipc.request_timeout()) {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => {
                eprintln!("Uploader is not running");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(error = %err, "quit failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn upload_service(config: &ReporterConfig) -> UploadService {
    UploadService::new(
        Box::new(HttpTransportFactory::from_config(&config.upload)),
        config.upload.max_concurrent,
        config.upload.delete_after_upload,
    )
}

fn serve(storage: &StorageConfig, config: &ReporterConfig) -> ExitCode {
    let socket = storage.uploader_socket();
    let listener = match wire::bind(&socket) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(
                error = %err,
                path = %socket.display(),
                "Failed to bind uploader socket"
            );
            return ExitCode::FAILURE;
        }
    };

    let result = upload_service(config).serve(listener, config.ipc.request_timeout());
    if let Err(err) = fs_err::remove_file(&socket) {
        tracing::debug!(error = %err, "Uploader socket already gone");
    }
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Failed to start uploader service");
            ExitCode::FAILURE
        }
    }
}
