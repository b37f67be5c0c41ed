//! Logging initialization for the realtime engine.
//!
//! All components log through `tracing`; this wires the observability
//! package once at startup. Environment overrides:
//!
//! - `CASEDESK_LOG_FORMAT`: `compact` (default) or `json` for stderr
//! - `CASEDESK_LOG_FILE`: path of the central JSONL file
//! - `CASEDESK_LOG_FILE_DISABLED`: any value turns the file stream off

use observability::{LogConfig, StderrFormat};
use std::path::PathBuf;

const SERVICE_NAME: &str = "casedesk-realtime";

/// Initialize the logging system.
///
/// # Arguments
///
/// * `level` - Default log level (trace, debug, info, warn, error)
/// * `foreground` - Also write to stderr
pub fn init_logging(level: &str, foreground: bool) {
    let stderr_format = std::env::var("CASEDESK_LOG_FORMAT")
        .map(|name| StderrFormat::from_name(&name))
        .unwrap_or_default();

    let log_path = std::env::var("CASEDESK_LOG_FILE")
        .ok()
        .and_then(non_empty_env)
        .map(PathBuf::from);

    observability::init_with_config(LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level: level.into(),
        log_path,
        file_enabled: std::env::var_os("CASEDESK_LOG_FILE_DISABLED").is_none(),
        also_stderr: foreground,
        stderr_format,
    });
}

fn non_empty_env(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
