use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "app";

/// Verbosity selected by the global flags
pub fn console_level<'a>(debug: bool, quiet: bool, configured: &'a str) -> &'a str {
    if debug {
        "debug"
    } else if quiet {
        "error"
    } else {
        configured
    }
}

/// Filter for our own crate at `level`; `RUST_LOG` wins when set
fn crate_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), level)))
}

/// Daily-rotating `app.log` in `log_dir`, keeping `retention_days` files
fn file_appender(log_dir: &Path, retention_days: usize) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(retention_days.max(1))
        .build(log_dir)?;
    Ok(appender)
}

/// Initialize logging: stderr at `console_level`, plus a JSON file log at
/// `file_level` when `log_dir` is given. Keep the returned guard alive until
/// exit so buffered lines are flushed.
pub fn init_logging(
    console_level: &str,
    file_level: &str,
    log_dir: Option<&Path>,
    retention_days: usize,
) -> anyhow::Result<Option<WorkerGuard>> {
    let debug = console_level.eq_ignore_ascii_case("debug")
        || console_level.eq_ignore_ascii_case("trace");

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr)
        .with_filter(crate_filter(console_level));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry().with(fmt_layer).try_init()?;
        return Ok(None);
    };

    let (writer, guard) = tracing_appender::non_blocking(file_appender(log_dir, retention_days)?);
    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_filter(crate_filter(file_level));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_console_level() {
        assert_eq!(console_level(true, true, "warn"), "debug");
        assert_eq!(console_level(false, true, "warn"), "error");
        assert_eq!(console_level(false, false, "warn"), "warn");
    }

    #[test]
    fn test_file_appender_creates_dir() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        let _appender = file_appender(&logs, 7).unwrap();
        assert!(logs.is_dir());
    }
}
