//! Notification fan-out.
//!
//! [`NotificationDispatcher`] sends one notification to a subject over the
//! channels the caller asks for, honoring the subject's delivery
//! preferences. Email goes through a per-subject [`RateLimiter`] before any
//! provider call.

mod dispatcher;
mod rate_limiter;
mod render;

pub use dispatcher::{
    ChannelDelivery, ChannelDeliveryStatus, NotificationDispatcher, NotificationPayload,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use render::NotificationRenderer;
