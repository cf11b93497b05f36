//! Terminal and file logging setup.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logger thread handles, which must be kept alive for as long as the
/// logging targets will be used. Flushed automatically when dropped.
struct LoggingGuards {
    _stdout: WorkerGuard,
    _file: Option<WorkerGuard>,
}

/// Global root logger.
static LOGGING_GUARDS: OnceLock<LoggingGuards> = OnceLock::new();

/// Set up terminal logging, and file logging when a path is given.
///
/// Level filtering honors `RUST_LOG`, defaulting to `info`. Calling
/// again after successful initialization is a no-op.
pub fn init_logging(log_path: Option<&Path>) -> Result<(), String> {
    if LOGGING_GUARDS.get().is_some() {
        return Ok(());
    }

    // Filter for log level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| format!("Failed to set up logging env filter: {e}"))?;

    // Formatting for terminal logger
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(stdout_writer)
        .with_target(false);

    // Build the file logger when requested
    let mut file_guard = None;
    let file_layer = match log_path {
        Some(path) => {
            let logfile = OpenOptions::new()
                .create(true)
                .truncate(false)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to create log file: {e}"))?;
            let (file_writer, guard) = tracing_appender::non_blocking(logfile);
            file_guard = Some(guard);
            Some(
                fmt::layer()
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    // Set up global root logger
    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {e}"))?;

    let _ = LOGGING_GUARDS.set(LoggingGuards {
        _stdout: stdout_guard,
        _file: file_guard,
    });

    Ok(())
}
