//! # MessageDeliveryWorker: chat message delivery with bounded retries
//!
//! Takes a chat message from the caller to the live channel of its
//! consultation room: validate, persist once, dispatch, and retry the
//! failing step with its own backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌────────────────────┐
//! │ validate │──▶│ persist  │──▶│dispatch │──▶│ ChannelDispatcher  │
//! └──────────┘   └────┬─────┘   └────┬────┘   │ (connection mgr)   │
//!   terminal,         │ retry        │ retry  └────────────────────┘
//!   no I/O            ▼              ▼
//!                ┌─────────────────────────┐
//!                │ Storage (retry_count)   │
//!                └─────────────────────────┘
//! ```
//!
//! ## Retry rules
//!
//! - **Validation** failures (empty after trim, longer than
//!   `max_content_length` characters) are terminal and make no storage or
//!   transport call.
//! - **Persistence** failures are transport-class and are retried up to
//!   `max_retries` times. A persisted message is never persisted again.
//! - **Dispatch** failures retry only the dispatch step. Each retry reads the
//!   message's durable `retry_count`, refuses when it already reached
//!   `max_retries`, and otherwise increments it before retrying. Another
//!   process retrying the same message shares that bound.
//! - A dispatch to a channel that is not open (for example one disconnected
//!   while the message was in flight) is terminal: nothing would reopen it,
//!   so no retry is claimed.
//! - A `Queued` dispatch is a success: the connection manager flushes the
//!   payload once the channel is back.
//!
//! Retry delays follow [`ExponentialBackoff`]: `base * 2^(retry - 1)`
//! capped at `backoff_max`. With the defaults: 1s, 2s, 4s.
//!
//! ## Example
//!
//! ```ignore
//! let worker = MessageDeliveryWorker::new(DeliveryWorkerConfig::default(), storage, dispatcher);
//! let report = worker
//!     .send(NewMessage {
//!         channel_key: ChannelKey::consultation("42"),
//!         sender_id: "lawyer-7".into(),
//!         content: "Documents received.".into(),
//!     })
//!     .await;
//! assert!(report.is_delivered());
//! ```

mod report;

pub use report::{DeliveryReport, DeliveryStatus};

use realtime_core::{
    BackoffPolicy, ChannelDispatcher, ChannelKey, ChannelPayload, DeliveryError, DispatchFailure,
    DispatchOutcome, ExponentialBackoff, MessageId, NewMessage, PersistedMessage, ReadReceipt, Storage,
    StoredMessage,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Configuration for delivery validation and retry behavior.
///
/// # Fields
///
/// - `max_retries`: Retries after the first try, per step (default: 3)
/// - `backoff_base`: First retry delay (default: 1s)
/// - `backoff_max`: Retry delay cap (default: 30s)
/// - `max_content_length`: Longest accepted message in characters (default: 5000)
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_content_length: usize,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_content_length: 5_000,
        }
    }
}

impl DeliveryWorkerConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_max)
    }
}

/// Outcome of the dispatch step.
struct DispatchResult {
    status: DeliveryStatus,
    error: Option<DeliveryError>,
    dispatch_retries: u32,
}

/// Chat message delivery engine.
///
/// Stateless between calls; every retry decision for a persisted message is
/// taken from its durable counter, so several workers may share one storage.
pub struct MessageDeliveryWorker {
    config: DeliveryWorkerConfig,
    backoff: ExponentialBackoff,
    storage: Arc<dyn Storage>,
    dispatcher: Arc<dyn ChannelDispatcher>,
}

impl MessageDeliveryWorker {
    pub fn new(
        config: DeliveryWorkerConfig,
        storage: Arc<dyn Storage>,
        dispatcher: Arc<dyn ChannelDispatcher>,
    ) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            backoff,
            storage,
            dispatcher,
        }
    }

    pub fn config(&self) -> &DeliveryWorkerConfig {
        &self.config
    }

    /// Check message content without side effects.
    pub fn validate(&self, content: &str) -> Result<(), DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::Validation(
                "Message content must not be empty".to_string(),
            ));
        }

        let length = content.chars().count();
        if length > self.config.max_content_length {
            return Err(DeliveryError::Validation(format!(
                "Message content is {} characters; the limit is {}",
                length, self.config.max_content_length
            )));
        }

        Ok(())
    }

    /// Validate, persist, and dispatch a new message.
    pub async fn send(&self, input: NewMessage) -> DeliveryReport {
        if let Err(e) = self.validate(&input.content) {
            debug!(channel_key = %input.channel_key, error = %e, "Message rejected");
            return DeliveryReport::rejected(e);
        }

        let (persisted, retry_count) = match self.persist(&input).await {
            Ok(persisted) => persisted,
            Err((e, retry_count)) => {
                return DeliveryReport {
                    retry_count,
                    ..DeliveryReport::rejected(e)
                };
            }
        };

        let message = StoredMessage {
            id: persisted.id.clone(),
            channel_key: input.channel_key,
            sender_id: input.sender_id,
            content: input.content,
            created_at: persisted.created_at,
            retry_count: 0,
            is_read: false,
            read_at: None,
        };

        let result = self.dispatch(&message, 0).await;
        DeliveryReport {
            status: result.status,
            message_id: Some(message.id),
            error: result.error,
            retry_count,
            dispatch_retries: result.dispatch_retries,
        }
    }

    /// Re-dispatch an already persisted message, e.g. from a "retry" action.
    ///
    /// Counts as a retry: refuses when the durable counter is already at the
    /// bound, otherwise increments it first.
    pub async fn retry_dispatch(&self, key: &ChannelKey, message_id: &MessageId) -> DeliveryReport {
        let failed = |error: DeliveryError, dispatch_retries: u32| DeliveryReport {
            status: DeliveryStatus::Failed,
            message_id: Some(message_id.clone()),
            error: Some(error),
            retry_count: 0,
            dispatch_retries,
        };

        let message = match self.storage.fetch_message(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return failed(DeliveryError::NotFound(message_id.to_string()), 0),
            Err(e) => return failed(e.into(), 0),
        };

        if &message.channel_key != key {
            return failed(
                DeliveryError::Validation(format!(
                    "Message {} belongs to {}, not {}",
                    message_id, message.channel_key, key
                )),
                message.retry_count,
            );
        }

        let count = match self.reserve_retry(message_id).await {
            Ok(count) => count,
            Err((e, count)) => return failed(e, count),
        };

        info!(channel_key = %key, message_id = %message_id, retry = count, "Retrying dispatch");
        let result = self.dispatch(&message, count).await;
        DeliveryReport {
            status: result.status,
            message_id: Some(message.id),
            error: result.error,
            retry_count: 0,
            dispatch_retries: result.dispatch_retries,
        }
    }

    /// Mark a message as read by someone other than its sender.
    ///
    /// Repeating the call returns the original `read_at`.
    pub async fn mark_as_read(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<ReadReceipt, DeliveryError> {
        let receipt = self.storage.mark_read(message_id, reader_id).await?;
        debug!(message_id = %message_id, reader_id, read_at = %receipt.read_at, "Message read");
        Ok(receipt)
    }

    /// Persist with retries. Errors carry the number of retries made.
    async fn persist(&self, input: &NewMessage) -> Result<(PersistedMessage, u32), (DeliveryError, u32)> {
        let mut retries = 0u32;

        loop {
            let err = match self.storage.persist_message(input).await {
                Ok(persisted) => {
                    debug!(channel_key = %input.channel_key, message_id = %persisted.id, retries, "Message persisted");
                    return Ok((persisted, retries));
                }
                Err(e) => DeliveryError::from(e),
            };

            if !err.is_retryable() {
                return Err((err, retries));
            }
            if retries >= self.config.max_retries {
                warn!(channel_key = %input.channel_key, retries, error = %err, "Persist retries exhausted");
                return Err((
                    DeliveryError::ExhaustedRetry {
                        attempts: retries + 1,
                        last_error: err.to_string(),
                    },
                    retries,
                ));
            }

            let delay = self.backoff.delay(retries);
            retries += 1;
            warn!(
                channel_key = %input.channel_key,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Persist failed, retrying"
            );
            sleep(delay).await;
        }
    }

    /// Claim one retry on the durable counter.
    ///
    /// Returns the new count, or the refusal together with the current count.
    async fn reserve_retry(&self, message_id: &MessageId) -> Result<u32, (DeliveryError, u32)> {
        let current = self
            .storage
            .get_retry_count(message_id)
            .await
            .map_err(|e| (DeliveryError::from(e), 0))?;

        if current >= self.config.max_retries {
            return Err((
                DeliveryError::ExhaustedRetry {
                    attempts: current + 1,
                    last_error: "retry limit reached".to_string(),
                },
                current,
            ));
        }

        self.storage
            .increment_retry_count(message_id)
            .await
            .map_err(|e| (DeliveryError::from(e), current))
    }

    /// Dispatch with retries. `retries` is the durable count already claimed.
    async fn dispatch(&self, message: &StoredMessage, retries: u32) -> DispatchResult {
        let payload = ChannelPayload::message_created(message);
        let mut dispatch_retries = retries;
        let mut tries = 0u32;

        loop {
            if dispatch_retries > 0 && tries > 0 {
                let delay = self.backoff.delay(dispatch_retries - 1);
                debug!(
                    message_id = %message.id,
                    retry = dispatch_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before dispatch retry"
                );
                sleep(delay).await;
            }
            tries += 1;

            let failure = match self
                .dispatcher
                .dispatch(&message.channel_key, payload.clone())
                .await
            {
                DispatchOutcome::Sent => {
                    return DispatchResult {
                        status: DeliveryStatus::Sent,
                        error: None,
                        dispatch_retries,
                    }
                }
                DispatchOutcome::Queued { state } => {
                    debug!(message_id = %message.id, state = %state, "Message queued for flush");
                    return DispatchResult {
                        status: DeliveryStatus::Queued,
                        error: None,
                        dispatch_retries,
                    };
                }
                DispatchOutcome::Failed(failure @ DispatchFailure::ChannelNotOpen(_)) => {
                    warn!(
                        channel_key = %message.channel_key,
                        message_id = %message.id,
                        tries,
                        "Channel not open; giving up without retry"
                    );
                    return DispatchResult {
                        status: DeliveryStatus::Failed,
                        error: Some(DeliveryError::from(failure)),
                        dispatch_retries,
                    };
                }
                DispatchOutcome::Failed(failure) => failure,
            };

            let last_error = DeliveryError::from(failure);
            warn!(
                channel_key = %message.channel_key,
                message_id = %message.id,
                tries,
                error = %last_error,
                "Dispatch failed"
            );

            match self.reserve_retry(&message.id).await {
                Ok(count) => dispatch_retries = count,
                Err((DeliveryError::ExhaustedRetry { .. }, count)) => {
                    return DispatchResult {
                        status: DeliveryStatus::Failed,
                        error: Some(DeliveryError::ExhaustedRetry {
                            attempts: tries,
                            last_error: last_error.to_string(),
                        }),
                        dispatch_retries: count,
                    };
                }
                Err((e, count)) => {
                    return DispatchResult {
                        status: DeliveryStatus::Failed,
                        error: Some(e),
                        dispatch_retries: count,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use realtime_core::memory::InMemoryStorage;
    use realtime_core::{ChannelState, FailureClass, TransportError};
    use std::collections::VecDeque;

    /// Returns scripted outcomes in order, then `Sent`.
    #[derive(Default)]
    struct ScriptedDispatcher {
        outcomes: Mutex<VecDeque<DispatchOutcome>>,
        always_fail: Mutex<bool>,
        calls: Mutex<Vec<ChannelPayload>>,
    }

    impl ScriptedDispatcher {
        fn failing(times: usize) -> Self {
            let dispatcher = Self::default();
            for _ in 0..times {
                dispatcher.outcomes.lock().push_back(transport_failure());
            }
            dispatcher
        }

        fn always_failing() -> Self {
            let dispatcher = Self::default();
            *dispatcher.always_fail.lock() = true;
            dispatcher
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    fn transport_failure() -> DispatchOutcome {
        DispatchOutcome::Failed(DispatchFailure::Transport(TransportError::Send(
            "socket reset".to_string(),
        )))
    }

    #[async_trait]
    impl ChannelDispatcher for ScriptedDispatcher {
        async fn open(&self, _key: &ChannelKey) -> ChannelState {
            ChannelState::Connected
        }

        async fn dispatch(&self, _key: &ChannelKey, payload: ChannelPayload) -> DispatchOutcome {
            self.calls.lock().push(payload);
            if *self.always_fail.lock() {
                return transport_failure();
            }
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(DispatchOutcome::Sent)
        }
    }

    fn worker(
        storage: &Arc<InMemoryStorage>,
        dispatcher: &Arc<ScriptedDispatcher>,
    ) -> MessageDeliveryWorker {
        MessageDeliveryWorker::new(
            DeliveryWorkerConfig::default(),
            storage.clone(),
            dispatcher.clone(),
        )
    }

    fn message(content: &str) -> NewMessage {
        NewMessage {
            channel_key: ChannelKey::consultation("42"),
            sender_id: "lawyer-7".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_delivers_on_first_try() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Sent);
        assert!(report.error.is_none());
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.dispatch_retries, 0);

        let stored = storage.messages();
        assert_eq!(stored.len(), 1);
        assert_eq!(report.message_id, Some(stored[0].id.clone()));
        assert_eq!(dispatcher.calls.lock()[0].message_id, report.message_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_makes_no_calls() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher)
            .send(message(&"a".repeat(5_001)))
            .await;

        assert_eq!(report.status, DeliveryStatus::Failed);
        let error = report.error.unwrap();
        assert!(matches!(error, DeliveryError::Validation(_)));
        assert_eq!(error.class(), FailureClass::Validation);
        assert_eq!(storage.persist_calls(), 0);
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_limit_counts_characters() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let worker = worker(&storage, &dispatcher);

        // 5000 two-byte characters are within the limit.
        assert!(worker.validate(&"é".repeat(5_000)).is_ok());
        assert!(worker.validate(&"é".repeat(5_001)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_message_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher).send(message("   \n")).await;

        assert!(matches!(report.error, Some(DeliveryError::Validation(_))));
        assert_eq!(storage.persist_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_dispatch_failures_then_sent() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::failing(3));
        let start = tokio::time::Instant::now();

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.dispatch_retries, 3);
        assert_eq!(dispatcher.calls(), 4);
        assert_eq!(storage.persist_calls(), 1);
        assert_eq!(storage.messages()[0].retry_count, 3);
        // 1s + 2s + 4s of backoff.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_retries_are_bounded() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_failing());

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Failed);
        assert_eq!(report.dispatch_retries, 3);
        assert_eq!(dispatcher.calls(), 4);
        match report.error {
            Some(DeliveryError::ExhaustedRetry {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("socket reset"));
            }
            other => panic!("expected exhausted retry, got {:?}", other),
        }
        assert_eq!(storage.messages()[0].retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_is_terminal() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        dispatcher
            .outcomes
            .lock()
            .push_back(DispatchOutcome::Failed(DispatchFailure::ChannelNotOpen(
                "consultation:42".to_string(),
            )));
        let start = tokio::time::Instant::now();

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Failed);
        assert!(matches!(report.error, Some(DeliveryError::Transport(_))));
        assert!(report.message_id.is_some());
        assert_eq!(report.dispatch_retries, 0);
        assert_eq!(dispatcher.calls(), 1);
        assert_eq!(storage.messages()[0].retry_count, 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_is_not_a_failure() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        dispatcher.outcomes.lock().push_back(DispatchOutcome::Queued {
            state: ChannelState::Connecting,
        });

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Queued);
        assert!(report.is_delivered());
        assert_eq!(report.dispatch_retries, 0);
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failures_are_retried_once_persisted() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.fail_next_persists(2);
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(report.retry_count, 2);
        assert_eq!(storage.persist_calls(), 3);
        assert_eq!(storage.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_exhaustion_skips_dispatch() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.fail_next_persists(10);
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher).send(message("hello")).await;

        assert_eq!(report.status, DeliveryStatus::Failed);
        assert_eq!(report.retry_count, 3);
        assert!(report.message_id.is_none());
        assert!(matches!(
            report.error,
            Some(DeliveryError::ExhaustedRetry { attempts: 4, .. })
        ));
        assert_eq!(storage.persist_calls(), 4);
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_dispatch_honors_durable_counter() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::failing(1));
        let worker = worker(&storage, &dispatcher);

        let report = worker.send(message("hello")).await;
        assert_eq!(report.dispatch_retries, 1);
        let id = report.message_id.unwrap();
        let key = ChannelKey::consultation("42");

        let report = worker.retry_dispatch(&key, &id).await;
        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(report.dispatch_retries, 2);

        // Another process used up the remaining retries.
        storage.set_retry_count(&id, 3);
        let calls = dispatcher.calls();
        let report = worker.retry_dispatch(&key, &id).await;

        assert_eq!(report.status, DeliveryStatus::Failed);
        assert!(matches!(
            report.error,
            Some(DeliveryError::ExhaustedRetry { .. })
        ));
        assert_eq!(report.dispatch_retries, 3);
        assert_eq!(dispatcher.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_dispatch_unknown_message() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let report = worker(&storage, &dispatcher)
            .retry_dispatch(&ChannelKey::consultation("42"), &MessageId::new())
            .await;

        assert!(matches!(report.error, Some(DeliveryError::NotFound(_))));
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_as_read_is_idempotent_and_rejects_sender() {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let worker = worker(&storage, &dispatcher);

        let id = worker.send(message("hello")).await.message_id.unwrap();

        assert_eq!(
            worker.mark_as_read(&id, "lawyer-7").await,
            Err(DeliveryError::SelfRead)
        );

        let first = worker.mark_as_read(&id, "client-3").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = worker.mark_as_read(&id, "client-3").await.unwrap();
        assert_eq!(first, second);
        assert!(storage.message(&id).unwrap().is_read);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = DeliveryReport::rejected(DeliveryError::Validation("empty".to_string()));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["dispatchRetries"], 0);
        assert_eq!(json["error"]["kind"], "validation");
    }
}
