//! Channel, message, and notification types.

use crate::{DispatchFailure, InvalidChannelKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key prefix for consultation chat rooms.
pub const CONSULTATION_PREFIX: &str = "consultation";

/// Key prefix for per-user notification streams.
pub const NOTIFICATIONS_PREFIX: &str = "notifications";

/// Identifies one logical live channel, e.g. `consultation:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Parse a raw key, rejecting empty or whitespace-only input.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidChannelKey> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidChannelKey(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Key for a consultation chat room.
    pub fn consultation(consultation_id: &str) -> Self {
        Self(format!("{}:{}", CONSULTATION_PREFIX, consultation_id))
    }

    /// Key for a user's notification stream.
    pub fn notifications(user_id: &str) -> Self {
        Self(format!("{}:{}", NOTIFICATIONS_PREFIX, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the first `:`, if any.
    pub fn subject(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, subject)| subject)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = InvalidChannelKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.0
    }
}

/// Connection state of a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Polling,
}

impl ChannelState {
    /// Whether a reconnection loop or polling loop owns the channel.
    pub fn has_active_loop(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Polling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Error => "error",
            ChannelState::Polling => "polling",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message identifier assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload handed to the transport for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    /// Event name, e.g. `message.created` or `notification`.
    pub event: String,
    /// Stored message this payload carries, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Event body.
    pub body: serde_json::Value,
}

impl ChannelPayload {
    pub fn new(event: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            message_id: None,
            body,
        }
    }

    /// Payload announcing a newly stored chat message.
    pub fn message_created(message: &StoredMessage) -> Self {
        Self {
            event: "message.created".to_string(),
            message_id: Some(message.id.clone()),
            body: serde_json::json!({
                "id": message.id.as_str(),
                "senderId": message.sender_id,
                "content": message.content,
                "createdAt": message.created_at.to_rfc3339(),
            }),
        }
    }
}

/// Input for persisting a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub channel_key: ChannelKey,
    pub sender_id: String,
    pub content: String,
}

/// Result of a successful persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// A message row as held by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub channel_key: ChannelKey,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// Confirmation that a message has been read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub read_at: DateTime<Utc>,
}

/// Result of handing a payload to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The transport accepted the payload.
    Sent,
    /// The payload is queued and will be flushed once the channel connects.
    Queued {
        /// Channel state at the time of queueing.
        state: ChannelState,
    },
    /// The payload was neither sent nor queued.
    Failed(DispatchFailure),
}

impl DispatchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }
}

/// Per-subject notification preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryPreferences {
    pub email_enabled: bool,
    pub realtime_enabled: bool,
    pub sms_enabled: bool,
    /// Category name to enabled flag; missing categories are enabled.
    pub per_category_flags: HashMap<String, bool>,
}

impl Default for DeliveryPreferences {
    fn default() -> Self {
        Self {
            email_enabled: true,
            realtime_enabled: true,
            sms_enabled: true,
            per_category_flags: HashMap::new(),
        }
    }
}

impl DeliveryPreferences {
    pub fn allows_category(&self, category: &str) -> bool {
        self.per_category_flags.get(category).copied().unwrap_or(true)
    }

    pub fn allows_channel(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Realtime => self.realtime_enabled,
            NotificationChannel::Email => self.email_enabled,
            NotificationChannel::Sms => self.sms_enabled,
        }
    }
}

/// Transport a notification may be delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Realtime,
    Email,
    Sms,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationChannel::Realtime => "realtime",
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
        };
        f.write_str(name)
    }
}

/// Outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Provider acknowledgement for an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub id: String,
}

/// Outbound text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub to: String,
    pub body: String,
}

/// Provider acknowledgement for a text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsReceipt {
    pub id: String,
}
