use std::env;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "unomerge.log";

fn filter_layer() -> EnvFilter {
    EnvFilter::new(env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string()))
}

/// Stdout-only bootstrap for `--self-test`, which must not write anywhere
/// near the volumes.
pub fn init_console_logger() {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(filter_layer())
        .init();
}

/// Full bootstrap: pretty stdout plus a non-blocking file appender.
///
/// The file lives directly under the run-log root (the directory the
/// per-run directories are created in), so the process log ends up next to
/// the artifacts it narrates instead of wherever the binary was launched
/// from.
pub fn init_logger(log_root: &Path) -> impl Drop {
    if let Err(e) = fs::create_dir_all(log_root) {
        eprintln!("Cannot create log directory {}: {}", log_root.display(), e);
    }

    let file_appender = tracing_appender::rolling::never(log_root, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(filter_layer())
        .init();

    info!(
        "Tracing is configured for stdout and {}",
        log_root.join(LOG_FILE_NAME).display()
    );

    guard
}
