//! Configuration management for the realtime engine.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding the log level.
const LOG_LEVEL_ENV: &str = "CASEDESK_LOG_LEVEL";

/// Main engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Live channel reconnection and polling.
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Per-message delivery retries.
    #[serde(default)]
    pub delivery: DeliverySettings,
    /// Email notification rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Notification rendering.
    #[serde(default)]
    pub notifications: NotificationSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Reconnection schedule, budget, and polling fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Delay before each reconnection attempt, in milliseconds.
    pub backoff_schedule_ms: Vec<u64>,
    /// Wall-clock budget for one reconnection loop, in milliseconds.
    pub reconnect_budget_ms: u64,
    /// Polling interval after the budget is exhausted; `None` disables polling.
    pub polling_interval_ms: Option<u64>,
    /// Longest wait for the transport to open a link, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Longest wait for the transport to accept one payload, in milliseconds.
    pub send_timeout_ms: u64,
    /// Capacity of each channel's inbound consumer queue.
    pub inbound_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            backoff_schedule_ms: vec![1_000, 5_000, 15_000, 30_000],
            reconnect_budget_ms: 30_000,
            polling_interval_ms: Some(30_000),
            connect_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            inbound_capacity: 256,
        }
    }
}

impl ConnectionSettings {
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.backoff_schedule_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn reconnect_budget(&self) -> Duration {
        Duration::from_millis(self.reconnect_budget_ms)
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        self.polling_interval_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Retry bound and backoff for a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Retries after the first try.
    pub max_retries: u32,
    /// First retry delay, in milliseconds; doubles per retry.
    pub base_delay_ms: u64,
    /// Cap on the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum message length in characters.
    pub max_content_length: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_content_length: 5_000,
        }
    }
}

impl DeliverySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Sliding-window limit on outbound email notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Trailing window length, in seconds.
    pub window_secs: u64,
    /// Admissions allowed per subject within the window.
    pub max_per_window: usize,
    /// How often empty subject windows are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_per_window: 5,
            sweep_interval_secs: 300,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Values used when rendering notification emails and texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Product name shown in subjects and footers.
    pub product_name: String,
    /// Base URL for relative notification links.
    pub app_url: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            product_name: "Casedesk".to_string(),
            app_url: "https://app.casedesk.app".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            connection: ConnectionSettings::default(),
            delivery: DeliverySettings::default(),
            rate_limit: RateLimitSettings::default(),
            notifications: NotificationSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the base directory, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        debug!(path = %config_path.display(), log_level = %config.log_level, "Configuration loaded");
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.connection.backoff_schedule_ms.is_empty() {
            return Err(CoreError::Config(
                "connection.backoff_schedule_ms must not be empty".to_string(),
            ));
        }
        if self.connection.backoff_schedule_ms.contains(&0) {
            return Err(CoreError::Config(
                "connection.backoff_schedule_ms entries must be positive".to_string(),
            ));
        }
        if self.connection.connect_timeout_ms == 0 || self.connection.send_timeout_ms == 0 {
            return Err(CoreError::Config(
                "connection.connect_timeout_ms and connection.send_timeout_ms must be positive"
                    .to_string(),
            ));
        }
        if self.connection.inbound_capacity == 0 {
            return Err(CoreError::Config(
                "connection.inbound_capacity must be positive".to_string(),
            ));
        }
        if self.connection.polling_interval_ms == Some(0) {
            return Err(CoreError::Config(
                "connection.polling_interval_ms must be positive when set".to_string(),
            ));
        }
        if self.delivery.max_content_length == 0 {
            return Err(CoreError::Config(
                "delivery.max_content_length must be positive".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_per_window == 0 {
            return Err(CoreError::Config(
                "rate_limit.window_secs and rate_limit.max_per_window must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Override configuration from environment variables.
    /// Only log_level can be overridden at runtime.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(LOG_LEVEL_ENV) {
            self.log_level = log_level;
        }
    }
}
