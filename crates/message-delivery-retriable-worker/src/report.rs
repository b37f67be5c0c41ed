use realtime_core::{DeliveryError, MessageId};
use serde::Serialize;

/// Final status of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Persisted and accepted by the live channel.
    Sent,
    /// Persisted; the channel is reconnecting and will flush it.
    Queued,
    /// Rejected or out of retries. `error` says which.
    Failed,
}

/// Outcome of [`MessageDeliveryWorker::send`](crate::MessageDeliveryWorker::send)
/// and [`retry_dispatch`](crate::MessageDeliveryWorker::retry_dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub status: DeliveryStatus,
    /// Set once the message has been persisted.
    pub message_id: Option<MessageId>,
    pub error: Option<DeliveryError>,
    /// Persistence retries made by this call.
    pub retry_count: u32,
    /// Durable dispatch-retry counter after this call.
    pub dispatch_retries: u32,
}

impl DeliveryReport {
    /// Report for a message that never reached storage.
    pub fn rejected(error: DeliveryError) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            message_id: None,
            error: Some(error),
            retry_count: 0,
            dispatch_retries: 0,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Sent | DeliveryStatus::Queued)
    }
}
