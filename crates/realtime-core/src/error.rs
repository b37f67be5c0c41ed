//! Error taxonomy for the realtime delivery engine.
//!
//! Collaborator errors (`TransportError`, `StorageError`, `SenderError`) are
//! what the injected services report. `DeliveryError` is the only error type
//! that crosses the public API; every collaborator error is folded into one
//! of its variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of the last failure seen by a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Deterministic input problem; never retried.
    Validation,
    /// Connection, persistence, or dispatch problem; retried up to a bound.
    Transport,
}

/// Channel key could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid channel key: {0:?}")]
pub struct InvalidChannelKey(pub String);

/// Error reported by the realtime transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Channel could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payload could not be handed to the transport.
    #[error("Send failed: {0}")]
    Send(String),

    /// The link was closed underneath the caller.
    #[error("Link closed")]
    LinkClosed,

    /// The transport did not answer an open or send within its deadline;
    /// the call is abandoned and counted as a failure.
    #[error("Operation timed out")]
    Timeout,
}

/// Error reported by the storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend could not be reached.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// No row for the given message id.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// Reader and sender are the same user.
    #[error("Cannot mark own message as read")]
    SelfRead,

    /// Any other backend failure.
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Error reported by an email or sms provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SenderError {
    /// Provider rejected or failed the request.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Recipient address is missing or malformed.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// Reason a dispatch could neither send nor queue a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    /// No live channel handle exists for the key.
    #[error("Channel not open: {0}")]
    ChannelNotOpen(String),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Typed failure surfaced by the public API.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeliveryError {
    /// Content empty or over the length bound.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection, persistence, or dispatch failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Admission denied by the rate limiter.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Attempt to mark one's own message as read.
    #[error("Cannot mark own message as read")]
    SelfRead,

    /// Referenced message does not exist.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// Retry bound exceeded.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetry {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Display form of the final underlying error.
        last_error: String,
    },
}

impl DeliveryError {
    /// Classify the error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            DeliveryError::Transport(_) | DeliveryError::ExhaustedRetry { .. } => {
                FailureClass::Transport
            }
            _ => FailureClass::Validation,
        }
    }

    /// Whether a retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transport(_))
    }
}

impl From<StorageError> for DeliveryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SelfRead => DeliveryError::SelfRead,
            StorageError::NotFound(id) => DeliveryError::NotFound(id),
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}

impl From<DispatchFailure> for DeliveryError {
    fn from(err: DispatchFailure) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

impl From<SenderError> for DeliveryError {
    fn from(err: SenderError) -> Self {
        match err {
            SenderError::InvalidRecipient(reason) => DeliveryError::Validation(reason),
            SenderError::Provider(reason) => DeliveryError::Transport(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_retry_display_includes_attempts() {
        let err = DeliveryError::ExhaustedRetry {
            attempts: 4,
            last_error: "Send failed: socket reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 4 attempts: Send failed: socket reset"
        );
    }

    #[test]
    fn storage_errors_fold_into_delivery_errors() {
        assert_eq!(
            DeliveryError::from(StorageError::SelfRead),
            DeliveryError::SelfRead
        );
        assert_eq!(
            DeliveryError::from(StorageError::NotFound("m-1".to_string())),
            DeliveryError::NotFound("m-1".to_string())
        );
        let err = DeliveryError::from(StorageError::Unavailable("pool".to_string()));
        assert!(err.is_retryable());
        assert_eq!(err.class(), FailureClass::Transport);
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = DeliveryError::Validation("empty".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.class(), FailureClass::Validation);
    }

    #[test]
    fn dispatch_failure_is_transport_class() {
        let err: DeliveryError = DispatchFailure::ChannelNotOpen("consultation:1".to_string()).into();
        assert_eq!(
            err,
            DeliveryError::Transport("Channel not open: consultation:1".to_string())
        );
    }

    #[test]
    fn delivery_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(DeliveryError::RateLimited("user-1".to_string())).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["detail"], "user-1");
    }
}
