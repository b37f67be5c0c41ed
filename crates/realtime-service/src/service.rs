use crate::settings::{connection_config, delivery_config, rate_limiter_config, renderer};
use crate::{ServiceError, ServiceResult};
use connection_manager::{ConnectionManager, InboundMessage};
use message_delivery_retriable_worker::{DeliveryReport, MessageDeliveryWorker};
use notification_dispatch::{
    ChannelDelivery, NotificationDispatcher, NotificationPayload, RateLimiter,
};
use parking_lot::Mutex;
use realtime_config_and_utils::Config;
use realtime_core::{
    ChannelKey, ChannelState, DeliveryError, EmailSender, MessageId, NewMessage,
    NotificationChannel, ReadReceipt, SettingsProvider, SmsSender, Storage, Transport,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Collects configuration and collaborators for [`RealtimeService`].
pub struct RealtimeServiceBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
    settings: Option<Arc<dyn SettingsProvider>>,
    email: Option<Arc<dyn EmailSender>>,
    sms: Option<Arc<dyn SmsSender>>,
}

impl RealtimeServiceBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }

    /// Optional; without it the sms channel is always skipped.
    pub fn sms(mut self, sms: Arc<dyn SmsSender>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub fn build(self) -> ServiceResult<RealtimeService> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or(ServiceError::MissingCollaborator("transport"))?;
        let storage = self
            .storage
            .ok_or(ServiceError::MissingCollaborator("storage"))?;
        let settings = self
            .settings
            .ok_or(ServiceError::MissingCollaborator("settings"))?;
        let email = self
            .email
            .ok_or(ServiceError::MissingCollaborator("email"))?;

        let connections = Arc::new(ConnectionManager::new(
            transport,
            connection_config(&self.config.connection),
        ));
        let delivery = MessageDeliveryWorker::new(
            delivery_config(&self.config.delivery),
            storage,
            connections.clone(),
        );
        let rate_limiter = Arc::new(RateLimiter::new(rate_limiter_config(
            &self.config.rate_limit,
        )));

        let mut notifications = NotificationDispatcher::new(
            settings,
            connections.clone(),
            email,
            rate_limiter.clone(),
            renderer(&self.config.notifications),
        );
        if let Some(sms) = self.sms {
            notifications = notifications.with_sms(sms);
        }

        info!(
            max_retries = self.config.delivery.max_retries,
            reconnect_budget_ms = self.config.connection.reconnect_budget_ms,
            polling = self.config.connection.polling_interval_ms.is_some(),
            "Realtime service built"
        );

        Ok(RealtimeService {
            config: self.config,
            connections,
            delivery,
            notifications,
            rate_limiter,
            sweeper: Mutex::new(None),
        })
    }
}

/// Realtime delivery engine facade.
pub struct RealtimeService {
    config: Config,
    connections: Arc<ConnectionManager>,
    delivery: MessageDeliveryWorker,
    notifications: NotificationDispatcher,
    rate_limiter: Arc<RateLimiter>,
    sweeper: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl RealtimeService {
    pub fn builder(config: Config) -> RealtimeServiceBuilder {
        RealtimeServiceBuilder {
            config,
            transport: None,
            storage: None,
            settings: None,
            email: None,
            sms: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Open (or keep) the live channel for `key`.
    pub async fn connect(&self, key: &ChannelKey) -> ChannelState {
        self.connections.connect(key).await
    }

    pub async fn disconnect(&self, key: &ChannelKey) -> bool {
        self.connections.disconnect(key).await
    }

    /// Validate, persist, and deliver a chat message.
    ///
    /// The message's channel is opened on demand; invalid content is
    /// rejected before anything is opened or stored.
    pub async fn send_message(&self, input: NewMessage) -> DeliveryReport {
        if let Err(e) = self.delivery.validate(&input.content) {
            return DeliveryReport::rejected(e);
        }

        self.connections.connect(&input.channel_key).await;
        self.delivery.send(input).await
    }

    /// Retry delivery of a stored message, sharing its durable retry bound.
    pub async fn retry_message(&self, key: &ChannelKey, message_id: &MessageId) -> DeliveryReport {
        self.connections.connect(key).await;
        self.delivery.retry_dispatch(key, message_id).await
    }

    pub async fn mark_as_read(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<ReadReceipt, DeliveryError> {
        self.delivery.mark_as_read(message_id, reader_id).await
    }

    pub async fn dispatch_notification(
        &self,
        subject_id: &str,
        category: &str,
        payload: &NotificationPayload,
        channels: &[NotificationChannel],
    ) -> Vec<ChannelDelivery> {
        self.notifications
            .dispatch_notification(subject_id, category, payload, channels)
            .await
    }

    pub fn get_connection_state(&self, key: &ChannelKey) -> ChannelState {
        self.connections.state(key)
    }

    pub fn watch_connection_state(&self, key: &ChannelKey) -> Option<watch::Receiver<ChannelState>> {
        self.connections.watch_state(key)
    }

    /// Inbound payloads for a connected channel; available once per channel.
    pub fn take_receiver(&self, key: &ChannelKey) -> Option<mpsc::Receiver<InboundMessage>> {
        self.connections.take_receiver(key)
    }

    /// Start the rate limiter's background sweeper. Repeated calls are no-ops.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = self.rate_limiter.clone().spawn_sweeper(shutdown_rx);
        *sweeper = Some((shutdown_tx, handle));
        debug!("Rate limiter sweeper started");
    }

    /// Stop background work and disconnect every channel.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some((shutdown_tx, handle)) = sweeper {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }

        let channels = self.connections.channel_count();
        self.connections.disconnect_all().await;
        info!(channels, "Realtime service shut down");
    }
}
