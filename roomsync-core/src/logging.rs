use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// Both formats share one layer setup and differ only in how events are
/// rendered. `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let layer = fmt::layer()
        .with_writer(log_writer(config.file_path.as_deref())?)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_line_number(true);
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        registry
            .with(layer.json().with_current_span(true).with_span_list(true).with_file(true))
            .try_init()?;
    } else {
        registry.with(layer.pretty().with_file(false)).try_init()?;
    }

    Ok(())
}

/// Append to `file_path` when set, otherwise write to stdout
fn log_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    let Some(file_path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };
    let file = OpenOptions::new().create(true).append(true).open(file_path)?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

/// Generate a session id used to correlate log lines of one room
#[must_use]
pub fn generate_session_id() -> String {
    nanoid::nanoid!(12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("debug").is_ok());
        assert!(parse_log_level("info").is_ok());
        assert!(parse_log_level("Warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_log_writer_opens_file_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomsync.log");
        std::fs::write(&path, "existing\n").unwrap();

        assert!(log_writer(path.to_str()).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\n");
        assert!(log_writer(Some("/nonexistent-dir/roomsync.log")).is_err());
        assert!(log_writer(None).is_ok());
    }

    #[test]
    fn test_generate_session_id() {
        let first = generate_session_id();
        let second = generate_session_id();

        assert_eq!(first.len(), 12);
        assert_ne!(first, second);
    }
}
