//! Structured logging with optional daily-rotated file output.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns the file writer guard when file logging is enabled; keep it alive
/// for the life of the process. Returns `None` if a subscriber was already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true);

    let appender = config.file.as_deref().and_then(|log_path| match open_log_file(log_path) {
        Ok(appender) => Some(appender),
        Err(err) => {
            // No subscriber yet, so this cannot go through tracing
            eprintln!("file logging disabled, cannot open {}: {err}", log_path.display());
            None
        }
    });
    let file_enabled = appender.is_some();

    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init();

    if installed.is_err() {
        return None;
    }
    if let Some(path) = config.file.as_ref().filter(|_| file_enabled) {
        tracing::info!(path = %path.display(), "file logging enabled");
    }
    guard
}

/// Daily-rolling appender for `log_path`, creating its directory first
fn open_log_file(log_path: &Path) -> io::Result<RollingFileAppender> {
    let dir = log_path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = log_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("dx-sync.log");

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".into(),
            file: Some(dir.path().join("logs/relay.log")),
        };

        let _first = init_logging(&config);
        assert!(init_logging(&config).is_none());
    }

    #[test]
    fn unusable_log_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        assert!(open_log_file(&blocker.join("relay.log")).is_err());
        assert!(open_log_file(&dir.path().join("logs/relay.log")).is_ok());
        assert!(dir.path().join("logs").is_dir());
    }
}
