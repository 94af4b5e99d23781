//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::{prelude::*, registry};

fn default_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// initiate the global tracing subscriber: stdout plus an appended log file.
///
/// The returned guard keeps the non-blocking writer thread alive; hold it for
/// the lifetime of the process.
pub fn init<P: AsRef<Path>>(log_file: P, verbosity: u8) -> WorkerGuard {
    let log_file = log_file.as_ref();
    let dir = log_file.parent().filter(|p| !p.as_os_str().is_empty());
    let file = log_file.file_name().expect("log file name");

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level(verbosity).into())
        .from_env_lossy();

    let stdout_layer = layer().with_writer(std::io::stdout).with_target(true);

    let file_appender = rolling::never(dir.unwrap_or(Path::new(".")), file);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false);

    registry()
        .with(stdout_layer.and_then(file_layer).with_filter(env_filter))
        .init();

    file_guard
}
