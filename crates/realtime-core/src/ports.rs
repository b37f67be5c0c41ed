//! Collaborator traits consumed by the delivery engine.
//!
//! Implementations live outside this workspace (managed realtime service,
//! hosted database, email provider). The [`memory`](crate::memory) module
//! provides in-process versions for tests and simulation.

use crate::{
    ChannelKey, ChannelPayload, ChannelState, DeliveryPreferences, DispatchOutcome, EmailMessage,
    EmailReceipt, MessageId, NewMessage, PersistedMessage, ReadReceipt, SenderError, SmsMessage,
    SmsReceipt, StorageError, StoredMessage, TransportError,
};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Transport-assigned identifier of an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Event emitted by an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Payload delivered to this subscriber.
    Message(ChannelPayload),
    /// The transport closed the link, with an optional reason.
    Closed(Option<String>),
}

/// An open link returned by [`Transport::open_channel`].
#[derive(Debug)]
pub struct TransportLink {
    pub id: LinkId,
    /// Inbound events; the stream ending is treated like `Closed(None)`.
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Underlying publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link for the channel key.
    async fn open_channel(&self, key: &ChannelKey) -> Result<TransportLink, TransportError>;

    /// Publish a payload on an open link.
    async fn send(&self, link: LinkId, payload: &ChannelPayload) -> Result<(), TransportError>;

    /// Release the link. Must tolerate unknown or already-closed ids.
    async fn close_channel(&self, link: LinkId);
}

/// Durable message storage.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn persist_message(&self, input: &NewMessage) -> Result<PersistedMessage, StorageError>;

    /// Read-then-write increment of the message's `retry_count`.
    async fn increment_retry_count(&self, message_id: &MessageId) -> Result<u32, StorageError>;

    async fn get_retry_count(&self, message_id: &MessageId) -> Result<u32, StorageError>;

    /// Mark as read. Rejects with [`StorageError::SelfRead`] when the reader
    /// sent the message; returns the original `read_at` when already read.
    async fn mark_read(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<ReadReceipt, StorageError>;

    async fn fetch_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<StoredMessage>, StorageError>;
}

/// Per-subject notification preferences.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// `None` means no preferences were saved; callers default to all-enabled.
    async fn get_delivery_preferences(&self, subject_id: &str) -> Option<DeliveryPreferences>;
}

/// Outbound email provider.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<EmailReceipt, SenderError>;
}

/// Outbound text message provider.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, sms: &SmsMessage) -> Result<SmsReceipt, SenderError>;
}

/// Hands payloads to live channels.
///
/// Implemented by the connection manager; the delivery engine and the
/// notification dispatcher depend on this seam rather than on the manager.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    /// Make sure a channel handle exists for the key and is connecting or connected.
    async fn open(&self, key: &ChannelKey) -> ChannelState;

    async fn dispatch(&self, key: &ChannelKey, payload: ChannelPayload) -> DispatchOutcome;
}
