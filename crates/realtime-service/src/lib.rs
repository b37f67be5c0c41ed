//! # Realtime service
//!
//! The public API of the Casedesk realtime delivery engine, assembled from
//! its components with explicit dependency injection:
//!
//! - [`ConnectionManager`](connection_manager::ConnectionManager): live
//!   channels, reconnection, polling fallback, outbound queues
//! - [`MessageDeliveryWorker`](message_delivery_retriable_worker::MessageDeliveryWorker):
//!   validate, persist, and dispatch chat messages with bounded retries
//! - [`NotificationDispatcher`](notification_dispatch::NotificationDispatcher):
//!   preference-aware fan-out with rate-limited email
//!
//! ```rust,ignore
//! let service = RealtimeService::builder(Config::load(&paths)?)
//!     .transport(transport)
//!     .storage(storage)
//!     .settings(settings)
//!     .email(email)
//!     .build()?;
//!
//! service.connect(&ChannelKey::consultation("42")).await;
//! let report = service.send_message(message).await;
//! ```

mod error;
mod service;
mod settings;

pub use error::{ServiceError, ServiceResult};
pub use service::{RealtimeService, RealtimeServiceBuilder};

pub use connection_manager::InboundMessage;
pub use message_delivery_retriable_worker::{DeliveryReport, DeliveryStatus};
pub use notification_dispatch::{ChannelDelivery, ChannelDeliveryStatus, NotificationPayload};
