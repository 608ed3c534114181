use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "access_log_exporter=info,info";

/// Initializes the logging system.
///
/// Console output always goes to stdout. When `log_dir` is given, a JSON
/// layer additionally writes to a daily rotated file in that directory; the
/// returned guard must be held until exit so buffered lines are flushed.
pub fn init_logging(log_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let mut guard = None;
    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "access_log_exporter.log");
            let (non_blocking_writer, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);
            Some(fmt::layer().json().with_writer(non_blocking_writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter())
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    Ok(guard)
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
