//! # Observability
//!
//! Centralized logging setup for the Casedesk realtime services.
//!
//! Services call [`init`] or [`init_with_config`] once at startup and use
//! the standard `tracing` macros everywhere else. Where logs go is decided
//! here, not in the services:
//!
//! - a central JSONL file (`~/.casedesk/logs/dev.jsonl` by default), one
//!   structured line per event, safe to share between processes
//! - stderr, compact or JSON, for foreground runs
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "casedesk-realtime".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! tracing::info!("ready");
//! ```

mod writer;

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

pub use writer::CentralLogWriter;

/// Output format for the stderr stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl StderrFormat {
    /// Parse `compact` / `json`, case-insensitive; anything else is compact.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            StderrFormat::Json
        } else {
            StderrFormat::Compact
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, recorded once at startup.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Central JSONL file. `None` uses `~/.casedesk/logs/dev.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Write the central JSONL file at all.
    pub file_enabled: bool,

    /// Also emit logs to stderr for immediate feedback.
    pub also_stderr: bool,

    /// Format of the stderr stream.
    pub stderr_format: StderrFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            file_enabled: true,
            also_stderr: false,
            stderr_format: StderrFormat::Compact,
        }
    }
}

/// Initialize logging with default settings for the named service.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging, ignoring a subscriber that is already installed.
pub fn init_with_config(config: LogConfig) {
    let _ = try_init_with_config(config);
}

/// Initialize logging, reporting whether a global subscriber was installed.
///
/// When the log file cannot be opened the file stream is skipped and stderr
/// is used instead.
pub fn try_init_with_config(config: LogConfig) -> Result<(), TryInitError> {
    let log_path = config
        .log_path
        .clone()
        .or_else(writer::default_log_path)
        .filter(|_| config.file_enabled);

    let file_writer = log_path
        .as_ref()
        .and_then(|path| CentralLogWriter::new(path).ok());
    let file_failed = log_path.is_some() && file_writer.is_none();
    let stderr_enabled = config.also_stderr || file_writer.is_none();

    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(env_filter(&config.default_level))
    });

    let compact_layer = (stderr_enabled && config.stderr_format == StderrFormat::Compact).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    let json_layer = (stderr_enabled && config.stderr_format == StderrFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(compact_layer)
        .with(json_layer)
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        pid = std::process::id(),
        log_path = ?log_path,
        file_failed,
        "observability initialized"
    );
    Ok(())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(config.file_enabled);
        assert!(!config.also_stderr);
        assert_eq!(config.stderr_format, StderrFormat::Compact);
    }

    #[test]
    fn test_stderr_format_from_name() {
        assert_eq!(StderrFormat::from_name("JSON"), StderrFormat::Json);
        assert_eq!(StderrFormat::from_name("compact"), StderrFormat::Compact);
        assert_eq!(StderrFormat::from_name("pretty"), StderrFormat::Compact);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            service_name: "test".into(),
            log_path: Some(dir.path().join("test.jsonl")),
            ..Default::default()
        };

        // The first call may lose a race with another test; the second never wins.
        let _ = try_init_with_config(config.clone());
        assert!(try_init_with_config(config).is_err());
    }
}
