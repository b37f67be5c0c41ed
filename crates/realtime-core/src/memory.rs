//! In-process collaborator implementations.
//!
//! These back the unit and integration tests and the `simulate` command.
//! Each one records the calls it receives and can be scripted to fail a
//! number of times, so retry and reconnection behavior can be observed
//! without a network.

use crate::{
    ChannelKey, ChannelPayload, DeliveryPreferences, EmailMessage, EmailReceipt, EmailSender,
    LinkEvent, LinkId, MessageId, NewMessage, PersistedMessage, ReadReceipt, SenderError,
    SettingsProvider, SmsMessage, SmsReceipt, SmsSender, Storage, StorageError, StoredMessage,
    Transport, TransportError, TransportLink,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each scripted link's event queue.
const LINK_EVENT_CAPACITY: usize = 64;

/// One call observed by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(ChannelKey),
    Send(ChannelKey),
    Close(LinkId),
}

#[derive(Default)]
struct TransportScript {
    open_failures: u32,
    fail_all_opens: bool,
    hang_opens: bool,
    send_failures: u32,
    send_hangs: u32,
    links: HashMap<LinkId, (ChannelKey, mpsc::Sender<LinkEvent>)>,
    sent: Vec<(ChannelKey, ChannelPayload)>,
    calls: Vec<TransportCall>,
}

/// Transport whose failures are scripted by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<TransportScript>,
    next_link: AtomicU64,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `open_channel`.
    pub fn fail_next_opens(&self, count: u32) {
        self.script.lock().open_failures = count;
    }

    /// Fail every `open_channel` call until switched off.
    pub fn set_fail_all_opens(&self, fail: bool) {
        self.script.lock().fail_all_opens = fail;
    }

    /// Leave every `open_channel` call pending forever until switched off.
    pub fn set_hang_opens(&self, hang: bool) {
        self.script.lock().hang_opens = hang;
    }

    /// Fail the next `count` calls to `send`.
    pub fn fail_next_sends(&self, count: u32) {
        self.script.lock().send_failures = count;
    }

    /// Leave the next `count` calls to `send` pending forever.
    pub fn hang_next_sends(&self, count: u32) {
        self.script.lock().send_hangs = count;
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.script.lock().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().calls.len()
    }

    pub fn open_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Open(_)))
    }

    pub fn send_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Send(_)))
    }

    pub fn close_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Close(_)))
    }

    /// Payloads accepted by `send`, in acceptance order.
    pub fn sent_to(&self, key: &ChannelKey) -> Vec<ChannelPayload> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|(sent_key, _)| sent_key == key)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of links currently open.
    pub fn open_links(&self) -> usize {
        self.script.lock().links.len()
    }

    /// Push an inbound payload to every open link for the key.
    ///
    /// Returns the number of links that accepted it.
    pub fn deliver(&self, key: &ChannelKey, payload: ChannelPayload) -> usize {
        let script = self.script.lock();
        script
            .links
            .values()
            .filter(|(link_key, _)| link_key == key)
            .filter(|(_, events)| events.try_send(LinkEvent::Message(payload.clone())).is_ok())
            .count()
    }

    /// Simulate the transport dropping every link for the key.
    pub fn drop_links(&self, key: &ChannelKey, reason: &str) {
        let mut script = self.script.lock();
        let dropped: Vec<LinkId> = script
            .links
            .iter()
            .filter(|(_, (link_key, _))| link_key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            if let Some((_, events)) = script.links.remove(&id) {
                let _ = events.try_send(LinkEvent::Closed(Some(reason.to_string())));
            }
        }
    }

    fn open_link(
        &self,
        script: &mut TransportScript,
        key: &ChannelKey,
    ) -> Result<TransportLink, TransportError> {
        if script.fail_all_opens {
            return Err(TransportError::Connection("scripted outage".to_string()));
        }
        if script.open_failures > 0 {
            script.open_failures -= 1;
            return Err(TransportError::Connection("scripted open failure".to_string()));
        }

        let id = LinkId(self.next_link.fetch_add(1, Ordering::SeqCst) + 1);
        let (events_tx, events) = mpsc::channel(LINK_EVENT_CAPACITY);
        script.links.insert(id, (key.clone(), events_tx));
        debug!(channel_key = %key, link = %id, "Scripted link opened");
        Ok(TransportLink { id, events })
    }

    fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.script.lock().calls.iter().filter(|c| predicate(c)).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_channel(&self, key: &ChannelKey) -> Result<TransportLink, TransportError> {
        {
            let mut script = self.script.lock();
            script.calls.push(TransportCall::Open(key.clone()));
            if !script.hang_opens {
                return self.open_link(&mut script, key);
            }
        }

        debug!(channel_key = %key, "Scripted open left pending");
        std::future::pending().await
    }

    async fn send(&self, link: LinkId, payload: &ChannelPayload) -> Result<(), TransportError> {
        {
            let mut script = self.script.lock();
            let key = match script.links.get(&link) {
                Some((key, _)) => key.clone(),
                None => return Err(TransportError::LinkClosed),
            };
            script.calls.push(TransportCall::Send(key.clone()));

            if script.send_hangs == 0 {
                if script.send_failures > 0 {
                    script.send_failures -= 1;
                    return Err(TransportError::Send("scripted send failure".to_string()));
                }
                script.sent.push((key, payload.clone()));
                return Ok(());
            }
            script.send_hangs -= 1;
        }

        debug!(link = %link, "Scripted send left pending");
        std::future::pending().await
    }

    async fn close_channel(&self, link: LinkId) {
        let mut script = self.script.lock();
        script.calls.push(TransportCall::Close(link));
        script.links.remove(&link);
    }
}

#[derive(Default)]
struct StorageState {
    messages: HashMap<MessageId, StoredMessage>,
    order: Vec<MessageId>,
    persist_failures: u32,
    persist_calls: u32,
}

/// Message storage held in process memory.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<StorageState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `persist_message`.
    pub fn fail_next_persists(&self, count: u32) {
        self.state.lock().persist_failures = count;
    }

    pub fn persist_calls(&self) -> u32 {
        self.state.lock().persist_calls
    }

    /// Stored messages in insertion order.
    pub fn messages(&self) -> Vec<StoredMessage> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<StoredMessage> {
        self.state.lock().messages.get(message_id).cloned()
    }

    /// Overwrite a retry counter, as another process would.
    pub fn set_retry_count(&self, message_id: &MessageId, count: u32) {
        if let Some(message) = self.state.lock().messages.get_mut(message_id) {
            message.retry_count = count;
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn persist_message(&self, input: &NewMessage) -> Result<PersistedMessage, StorageError> {
        let mut state = self.state.lock();
        state.persist_calls += 1;

        if state.persist_failures > 0 {
            state.persist_failures -= 1;
            return Err(StorageError::Unavailable("scripted persist failure".to_string()));
        }

        let id = MessageId::new();
        let created_at = Utc::now();
        state.messages.insert(
            id.clone(),
            StoredMessage {
                id: id.clone(),
                channel_key: input.channel_key.clone(),
                sender_id: input.sender_id.clone(),
                content: input.content.clone(),
                created_at,
                retry_count: 0,
                is_read: false,
                read_at: None,
            },
        );
        state.order.push(id.clone());
        Ok(PersistedMessage { id, created_at })
    }

    async fn increment_retry_count(&self, message_id: &MessageId) -> Result<u32, StorageError> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))?;
        let current = message.retry_count;
        message.retry_count = current.saturating_add(1);
        Ok(message.retry_count)
    }

    async fn get_retry_count(&self, message_id: &MessageId) -> Result<u32, StorageError> {
        self.state
            .lock()
            .messages
            .get(message_id)
            .map(|m| m.retry_count)
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))
    }

    async fn mark_read(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<ReadReceipt, StorageError> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))?;

        if message.sender_id == reader_id {
            return Err(StorageError::SelfRead);
        }

        let read_at = match message.read_at {
            Some(read_at) => read_at,
            None => {
                let now = Utc::now();
                message.is_read = true;
                message.read_at = Some(now);
                now
            }
        };

        Ok(ReadReceipt {
            message_id: message_id.clone(),
            read_at,
        })
    }

    async fn fetch_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self.state.lock().messages.get(message_id).cloned())
    }
}

/// Preferences keyed by subject id.
#[derive(Default)]
pub struct InMemorySettings {
    preferences: Mutex<HashMap<String, DeliveryPreferences>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preferences(&self, subject_id: &str, preferences: DeliveryPreferences) {
        self.preferences
            .lock()
            .insert(subject_id.to_string(), preferences);
    }
}

#[async_trait]
impl SettingsProvider for InMemorySettings {
    async fn get_delivery_preferences(&self, subject_id: &str) -> Option<DeliveryPreferences> {
        self.preferences.lock().get(subject_id).cloned()
    }
}

struct Outbox<T> {
    delivered: Vec<T>,
    failures: u32,
    attempts: u32,
}

impl<T> Default for Outbox<T> {
    fn default() -> Self {
        Self {
            delivered: Vec::new(),
            failures: 0,
            attempts: 0,
        }
    }
}

/// Email provider that records what it was asked to send.
#[derive(Default)]
pub struct RecordingEmailSender {
    outbox: Mutex<Outbox<EmailMessage>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a provider error.
    pub fn fail_next(&self, count: u32) {
        self.outbox.lock().failures = count;
    }

    /// Emails the provider accepted.
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.outbox.lock().delivered.clone()
    }

    /// Calls received, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.outbox.lock().attempts
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, email: &EmailMessage) -> Result<EmailReceipt, SenderError> {
        let mut outbox = self.outbox.lock();
        outbox.attempts += 1;
        if outbox.failures > 0 {
            outbox.failures -= 1;
            return Err(SenderError::Provider("scripted email failure".to_string()));
        }
        outbox.delivered.push(email.clone());
        Ok(EmailReceipt {
            id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

/// Sms provider that records what it was asked to send.
#[derive(Default)]
pub struct RecordingSmsSender {
    outbox: Mutex<Outbox<SmsMessage>>,
}

impl RecordingSmsSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.outbox.lock().failures = count;
    }

    pub fn sent(&self) -> Vec<SmsMessage> {
        self.outbox.lock().delivered.clone()
    }
}

#[async_trait]
impl SmsSender for RecordingSmsSender {
    async fn send(&self, sms: &SmsMessage) -> Result<SmsReceipt, SenderError> {
        let mut outbox = self.outbox.lock();
        outbox.attempts += 1;
        if outbox.failures > 0 {
            outbox.failures -= 1;
            return Err(SenderError::Provider("scripted sms failure".to_string()));
        }
        outbox.delivered.push(sms.clone());
        Ok(SmsReceipt {
            id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(sender: &str) -> NewMessage {
        NewMessage {
            channel_key: ChannelKey::consultation("1"),
            sender_id: sender.to_string(),
            content: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn storage_mark_read_is_idempotent() {
        let storage = InMemoryStorage::new();
        let persisted = storage.persist_message(&new_message("lawyer-1")).await.unwrap();

        let first = storage.mark_read(&persisted.id, "client-1").await.unwrap();
        let second = storage.mark_read(&persisted.id, "client-1").await.unwrap();
        assert_eq!(first.read_at, second.read_at);

        let stored = storage.message(&persisted.id).unwrap();
        assert!(stored.is_read);
    }

    #[tokio::test]
    async fn storage_rejects_self_read() {
        let storage = InMemoryStorage::new();
        let persisted = storage.persist_message(&new_message("lawyer-1")).await.unwrap();

        let result = storage.mark_read(&persisted.id, "lawyer-1").await;
        assert_eq!(result, Err(StorageError::SelfRead));
        assert!(!storage.message(&persisted.id).unwrap().is_read);
    }

    #[tokio::test]
    async fn storage_retry_counter_increments() {
        let storage = InMemoryStorage::new();
        let persisted = storage.persist_message(&new_message("a")).await.unwrap();

        assert_eq!(storage.get_retry_count(&persisted.id).await.unwrap(), 0);
        assert_eq!(storage.increment_retry_count(&persisted.id).await.unwrap(), 1);
        assert_eq!(storage.increment_retry_count(&persisted.id).await.unwrap(), 2);

        let missing = MessageId::from_string("missing");
        assert!(matches!(
            storage.increment_retry_count(&missing).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn storage_scripted_persist_failures() {
        let storage = InMemoryStorage::new();
        storage.fail_next_persists(2);

        assert!(storage.persist_message(&new_message("a")).await.is_err());
        assert!(storage.persist_message(&new_message("a")).await.is_err());
        assert!(storage.persist_message(&new_message("a")).await.is_ok());
        assert_eq!(storage.persist_calls(), 3);
        assert_eq!(storage.messages().len(), 1);
    }

    #[tokio::test]
    async fn transport_records_calls_and_scripts_failures() {
        let transport = ScriptedTransport::new();
        let key = ChannelKey::consultation("9");
        transport.fail_next_opens(1);

        assert!(transport.open_channel(&key).await.is_err());
        let link = transport.open_channel(&key).await.unwrap();

        transport.fail_next_sends(1);
        let payload = ChannelPayload::new("ping", serde_json::json!({}));
        assert!(transport.send(link.id, &payload).await.is_err());
        assert!(transport.send(link.id, &payload).await.is_ok());

        transport.close_channel(link.id).await;
        assert_eq!(
            transport.send(link.id, &payload).await,
            Err(TransportError::LinkClosed)
        );

        assert_eq!(transport.open_calls(), 2);
        assert_eq!(transport.send_calls(), 2);
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(transport.sent_to(&key), vec![payload]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_hangs_when_scripted() {
        let transport = ScriptedTransport::new();
        let key = ChannelKey::consultation("9");
        let wait = std::time::Duration::from_secs(60);

        transport.set_hang_opens(true);
        assert!(tokio::time::timeout(wait, transport.open_channel(&key))
            .await
            .is_err());
        transport.set_hang_opens(false);
        let link = transport.open_channel(&key).await.unwrap();

        transport.hang_next_sends(1);
        let payload = ChannelPayload::new("ping", serde_json::json!({}));
        assert!(tokio::time::timeout(wait, transport.send(link.id, &payload))
            .await
            .is_err());
        assert!(transport.send(link.id, &payload).await.is_ok());

        assert_eq!(transport.open_calls(), 2);
        assert_eq!(transport.send_calls(), 2);
        assert_eq!(transport.sent_to(&key), vec![payload]);
    }

    #[tokio::test]
    async fn sms_sender_starts_empty() {
        let sender = RecordingSmsSender::default();
        let sms = SmsMessage {
            to: "+15550100".to_string(),
            body: "hi".to_string(),
        };
        assert!(sender.sent().is_empty());
        assert!(sender.send(&sms).await.is_ok());
        assert_eq!(sender.sent(), vec![sms]);
    }

    #[tokio::test]
    async fn transport_delivers_and_drops_links() {
        let transport = ScriptedTransport::new();
        let key = ChannelKey::notifications("u1");
        let mut link = transport.open_channel(&key).await.unwrap();

        let payload = ChannelPayload::new("notification", serde_json::json!({"n": 1}));
        assert_eq!(transport.deliver(&key, payload.clone()), 1);
        assert_eq!(link.events.recv().await, Some(LinkEvent::Message(payload)));

        transport.drop_links(&key, "server restart");
        assert_eq!(
            link.events.recv().await,
            Some(LinkEvent::Closed(Some("server restart".to_string())))
        );
        assert_eq!(link.events.recv().await, None);
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn email_sender_records_and_fails() {
        let sender = RecordingEmailSender::new();
        let email = EmailMessage {
            to: "a@example.com".to_string(),
            subject: "s".to_string(),
            html: "<p>b</p>".to_string(),
            text: "b".to_string(),
        };
        sender.fail_next(1);
        assert!(sender.send(&email).await.is_err());
        assert!(sender.send(&email).await.is_ok());
        assert_eq!(sender.attempts(), 2);
        assert_eq!(sender.sent(), vec![email]);
    }

    #[tokio::test]
    async fn settings_return_saved_preferences() {
        let settings = InMemorySettings::new();
        assert!(settings.get_delivery_preferences("u1").await.is_none());

        let prefs = DeliveryPreferences {
            sms_enabled: false,
            ..Default::default()
        };
        settings.set_preferences("u1", prefs.clone());
        assert_eq!(settings.get_delivery_preferences("u1").await, Some(prefs));
    }
}
