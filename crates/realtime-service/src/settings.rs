//! Translation from file configuration to component configuration.

use connection_manager::ConnectionManagerConfig;
use message_delivery_retriable_worker::DeliveryWorkerConfig;
use notification_dispatch::{NotificationRenderer, RateLimiterConfig};
use realtime_config_and_utils::{
    ConnectionSettings, DeliverySettings, NotificationSettings, RateLimitSettings,
};
use realtime_core::ScheduleBackoff;

pub(crate) fn connection_config(settings: &ConnectionSettings) -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        backoff: ScheduleBackoff::new(settings.backoff_schedule()),
        reconnect_budget: settings.reconnect_budget(),
        polling_interval: settings.polling_interval(),
        connect_timeout: settings.connect_timeout(),
        send_timeout: settings.send_timeout(),
        inbound_capacity: settings.inbound_capacity,
    }
}

pub(crate) fn delivery_config(settings: &DeliverySettings) -> DeliveryWorkerConfig {
    DeliveryWorkerConfig {
        max_retries: settings.max_retries,
        backoff_base: settings.base_delay(),
        backoff_max: settings.max_delay(),
        max_content_length: settings.max_content_length,
    }
}

pub(crate) fn rate_limiter_config(settings: &RateLimitSettings) -> RateLimiterConfig {
    RateLimiterConfig {
        window: settings.window(),
        max_per_window: settings.max_per_window,
        sweep_interval: settings.sweep_interval(),
    }
}

pub(crate) fn renderer(settings: &NotificationSettings) -> NotificationRenderer {
    NotificationRenderer::new(settings.product_name.clone(), settings.app_url.clone())
}
