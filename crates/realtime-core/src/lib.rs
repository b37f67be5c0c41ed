//! Core types for the Casedesk realtime delivery engine.
//!
//! This crate provides:
//! - Channel, message, and notification types shared by every component
//! - The error taxonomy surfaced across the public API
//! - Backoff policies for reconnection and delivery retries
//! - Collaborator traits (transport, storage, settings, email, sms)
//! - In-process collaborator implementations for tests and simulation

pub mod backoff;
mod error;
pub mod memory;
mod ports;
mod types;

pub use backoff::{
    exponential_delay, BackoffPolicy, ExponentialBackoff, ScheduleBackoff, MIN_RECONNECT_DELAY,
};
pub use error::{
    DeliveryError, DispatchFailure, FailureClass, InvalidChannelKey, SenderError, StorageError,
    TransportError,
};
pub use ports::{
    ChannelDispatcher, EmailSender, LinkEvent, LinkId, SettingsProvider, SmsSender, Storage,
    Transport, TransportLink,
};
pub use types::{
    ChannelKey, ChannelPayload, ChannelState, DeliveryPreferences, DispatchOutcome, EmailMessage,
    EmailReceipt, MessageId, NewMessage, NotificationChannel, PersistedMessage, ReadReceipt,
    SmsMessage, SmsReceipt, StoredMessage, CONSULTATION_PREFIX, NOTIFICATIONS_PREFIX,
};
