//! Configuration, paths, and logging setup for the realtime delivery engine.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, ConnectionSettings, DeliverySettings, NotificationSettings, RateLimitSettings,
    DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
