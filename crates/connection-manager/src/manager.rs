//! Connection manager implementation.

use crate::config::ConnectionManagerConfig;
use crate::timers::{TaskFuture, TaskKind, TaskSlot};
use async_trait::async_trait;
use channel_outbox::{FlushReport, OutboundQueue};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realtime_core::{
    BackoffPolicy, ChannelDispatcher, ChannelKey, ChannelPayload, ChannelState, DispatchFailure,
    DispatchOutcome, LinkEvent, LinkId, Transport, TransportError, TransportLink,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// A payload received on a live channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel_key: ChannelKey,
    pub payload: ChannelPayload,
    pub received_at: DateTime<Utc>,
}

/// Per-channel state guarded by the channel lock.
///
/// Every transport call for a key is made while holding this lock.
struct ChannelHandle {
    /// Consecutive failed connection attempts.
    attempts: u32,
    link: Option<LinkId>,
    queue: OutboundQueue,
    /// Set by `disconnect`; nothing touches the transport afterwards.
    closed: bool,
}

struct ChannelEntry {
    key: ChannelKey,
    handle: Mutex<ChannelHandle>,
    state: watch::Sender<ChannelState>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    tasks: TaskSlot,
}

impl ChannelEntry {
    fn new(key: ChannelKey, inbound_capacity: usize) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));

        Self {
            key,
            handle: Mutex::new(ChannelHandle {
                attempts: 0,
                link: None,
                queue: OutboundQueue::new(),
                closed: false,
            }),
            state,
            inbound_tx,
            inbound_rx: parking_lot::Mutex::new(Some(inbound_rx)),
            tasks: TaskSlot::default(),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Callers hold the channel lock.
    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(channel_key = %self.key, from = %previous, to = %next, "Channel state changed");
        }
    }
}

/// Result of one connection attempt.
enum Attempt {
    Connected,
    Failed,
    /// The channel was disconnected meanwhile.
    Closed,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ConnectionManagerConfig,
    channels: RwLock<HashMap<ChannelKey, Arc<ChannelEntry>>>,
}

impl Shared {
    fn entry(&self, key: &ChannelKey) -> Option<Arc<ChannelEntry>> {
        self.channels.read().get(key).cloned()
    }

    fn get_or_create(&self, key: &ChannelKey) -> Arc<ChannelEntry> {
        let mut channels = self.channels.write();
        channels
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(channel_key = %key, "Creating channel");
                Arc::new(ChannelEntry::new(key.clone(), self.config.inbound_capacity))
            })
            .clone()
    }

    /// Every send is bounded by `send_timeout`.
    async fn flush(&self, queue: &mut OutboundQueue, link: LinkId) -> FlushReport {
        let transport = self.transport.clone();
        let limit = self.config.send_timeout;
        queue
            .flush(|payload| {
                let transport = transport.clone();
                async move {
                    timeout(limit, transport.send(link, &payload))
                        .await
                        .unwrap_or(Err(TransportError::Timeout))
                }
            })
            .await
    }

    /// `connect_timeout`, cut short by the reconnection deadline if any.
    fn open_timeout(&self, deadline: Option<Instant>) -> Duration {
        let limit = self.config.connect_timeout;
        match deadline {
            Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
            None => limit,
        }
    }

    /// Open a link and flush the queue over it.
    ///
    /// The channel counts as connected only once the queue is empty; a
    /// flush failure releases the link and counts as a failed attempt. An
    /// open that outlives its timeout is abandoned and also counts as failed.
    async fn attempt(
        self: &Arc<Self>,
        entry: &Arc<ChannelEntry>,
        handle: &mut ChannelHandle,
        deadline: Option<Instant>,
    ) -> Attempt {
        if handle.closed {
            return Attempt::Closed;
        }

        let limit = self.open_timeout(deadline);
        let opened = timeout(limit, self.transport.open_channel(&entry.key))
            .await
            .unwrap_or(Err(TransportError::Timeout));

        let TransportLink { id, events } = match opened {
            Ok(link) => link,
            Err(e) => {
                handle.attempts += 1;
                warn!(
                    channel_key = %entry.key,
                    attempt = handle.attempts,
                    timeout_ms = limit.as_millis() as u64,
                    error = %e,
                    "Channel connection failed"
                );
                return Attempt::Failed;
            }
        };

        let report = self.flush(&mut handle.queue, id).await;
        if let Some(e) = report.error {
            handle.attempts += 1;
            warn!(
                channel_key = %entry.key,
                link = %id,
                delivered = report.delivered,
                remaining = report.remaining,
                error = %e,
                "Flush after connect failed"
            );
            self.transport.close_channel(id).await;
            return Attempt::Failed;
        }

        handle.link = Some(id);
        handle.attempts = 0;
        entry.set_state(ChannelState::Connected);
        entry.tasks.spawn(
            TaskKind::Pump,
            pump_link(self.clone(), entry.clone(), id, events),
        );

        info!(channel_key = %entry.key, link = %id, flushed = report.delivered, "Channel connected");
        Attempt::Connected
    }

    /// Release a failed link and start a fresh reconnection loop.
    ///
    /// Must not be called from the reconnect task itself.
    async fn lose_link(
        self: &Arc<Self>,
        entry: &Arc<ChannelEntry>,
        handle: &mut ChannelHandle,
        link: LinkId,
    ) {
        handle.link = None;
        self.transport.close_channel(link).await;

        entry.set_state(ChannelState::Error);
        entry.set_state(ChannelState::Connecting);
        entry.tasks.spawn(
            TaskKind::Reconnect,
            reconnect_loop(self.clone(), entry.clone(), Instant::now()),
        );
    }

    /// Degraded mode after the reconnection budget is spent.
    async fn fall_back(self: &Arc<Self>, entry: &Arc<ChannelEntry>) {
        let interval = {
            let handle = entry.handle.lock().await;
            if handle.closed {
                return;
            }

            entry.set_state(ChannelState::Error);
            match self.config.polling_interval {
                Some(interval) => {
                    entry.set_state(ChannelState::Polling);
                    info!(
                        channel_key = %entry.key,
                        interval_ms = interval.as_millis() as u64,
                        "Falling back to polling"
                    );
                    interval
                }
                None => {
                    warn!(channel_key = %entry.key, "Polling disabled; channel left in error");
                    return;
                }
            }
        };

        loop {
            sleep(interval).await;

            let mut handle = entry.handle.lock().await;
            match self.attempt(entry, &mut handle, None).await {
                Attempt::Connected | Attempt::Closed => return,
                Attempt::Failed => {}
            }
        }
    }
}

/// Background reconnection: follow the backoff schedule until the budget,
/// measured from `started`, would be exceeded, then fall back to polling.
fn reconnect_loop(shared: Arc<Shared>, entry: Arc<ChannelEntry>, started: Instant) -> TaskFuture {
    Box::pin(async move {
        let budget = shared.config.reconnect_budget;
        let deadline = started + budget;
        let mut attempt: u32 = 0;

        loop {
            let delay = shared.config.backoff.delay(attempt);
            if started.elapsed() + delay > budget {
                break;
            }

            debug!(
                channel_key = %entry.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            sleep(delay).await;
            attempt = attempt.saturating_add(1);

            let mut handle = entry.handle.lock().await;
            match shared.attempt(&entry, &mut handle, Some(deadline)).await {
                Attempt::Connected | Attempt::Closed => return,
                Attempt::Failed => {}
            }
        }

        warn!(
            channel_key = %entry.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            budget_ms = budget.as_millis() as u64,
            "Reconnection budget exhausted"
        );
        shared.fall_back(&entry).await;
    })
}

/// Forward link events to the inbound queue until the link closes.
fn pump_link(
    shared: Arc<Shared>,
    entry: Arc<ChannelEntry>,
    link: LinkId,
    mut events: mpsc::Receiver<LinkEvent>,
) -> TaskFuture {
    Box::pin(async move {
        let reason = loop {
            match events.recv().await {
                Some(LinkEvent::Message(payload)) => {
                    let message = InboundMessage {
                        channel_key: entry.key.clone(),
                        payload,
                        received_at: Utc::now(),
                    };
                    if entry.inbound_tx.send(message).await.is_err() {
                        debug!(channel_key = %entry.key, "Inbound consumer dropped; discarding message");
                    }
                }
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };

        let mut handle = entry.handle.lock().await;
        if handle.closed || handle.link != Some(link) {
            return;
        }

        warn!(
            channel_key = %entry.key,
            link = %link,
            reason = reason.as_deref().unwrap_or("event stream ended"),
            "Channel link lost"
        );
        shared.lose_link(&entry, &mut handle, link).await;
    })
}

/// Owns every live channel and its outbound queue.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, ConnectionManagerConfig::default())
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.shared.config
    }

    /// Bring the channel up, creating its handle on first use.
    ///
    /// Does nothing when the channel is connected, connecting, or polling.
    /// Otherwise the first attempt runs inline; if it fails a background
    /// loop takes over and `Connecting` is returned.
    pub async fn connect(&self, key: &ChannelKey) -> ChannelState {
        let entry = self.shared.get_or_create(key);
        let mut handle = entry.handle.lock().await;
        if handle.closed {
            return ChannelState::Disconnected;
        }

        let current = entry.state();
        if current == ChannelState::Connected || current.has_active_loop() {
            debug!(channel_key = %key, state = %current, "Channel already active");
            return current;
        }

        info!(channel_key = %key, "Connecting channel");
        entry.set_state(ChannelState::Connecting);
        let started = Instant::now();
        let deadline = started + self.shared.config.reconnect_budget;

        match self.shared.attempt(&entry, &mut handle, Some(deadline)).await {
            Attempt::Connected => ChannelState::Connected,
            Attempt::Closed => ChannelState::Disconnected,
            Attempt::Failed => {
                entry.tasks.spawn(
                    TaskKind::Reconnect,
                    reconnect_loop(self.shared.clone(), entry.clone(), started),
                );
                ChannelState::Connecting
            }
        }
    }

    /// Tear the channel down: stop its tasks, close the link, drop queued
    /// payloads unsent, and forget the handle.
    ///
    /// Returns false when no channel existed for the key.
    pub async fn disconnect(&self, key: &ChannelKey) -> bool {
        let removed = self.shared.channels.write().remove(key);
        let Some(entry) = removed else {
            return false;
        };

        entry.tasks.close().await;

        let mut handle = entry.handle.lock().await;
        handle.closed = true;
        if let Some(link) = handle.link.take() {
            self.shared.transport.close_channel(link).await;
        }
        let dropped = handle.queue.clear();
        entry.set_state(ChannelState::Disconnected);

        info!(channel_key = %key, dropped, "Channel disconnected");
        true
    }

    /// Disconnect every channel.
    pub async fn disconnect_all(&self) {
        for key in self.channel_keys() {
            self.disconnect(&key).await;
        }
    }

    /// Send a payload now, or queue it until the channel connects.
    pub async fn dispatch(&self, key: &ChannelKey, payload: ChannelPayload) -> DispatchOutcome {
        let Some(entry) = self.shared.entry(key) else {
            debug!(channel_key = %key, "Dispatch to unknown channel");
            return DispatchOutcome::Failed(DispatchFailure::ChannelNotOpen(key.to_string()));
        };

        let mut handle = entry.handle.lock().await;
        if handle.closed {
            return DispatchOutcome::Failed(DispatchFailure::ChannelNotOpen(key.to_string()));
        }

        // Always enqueue first so a payload never overtakes older queued ones.
        let sequence = handle.queue.enqueue(payload);
        let state = entry.state();
        let link = match (state, handle.link) {
            (ChannelState::Connected, Some(link)) => link,
            _ => {
                debug!(
                    channel_key = %key,
                    sequence,
                    state = %state,
                    pending = handle.queue.len(),
                    "Payload queued"
                );
                return DispatchOutcome::Queued { state };
            }
        };

        let report = self.shared.flush(&mut handle.queue, link).await;
        match report.error {
            None => DispatchOutcome::Sent,
            Some(e) => {
                warn!(
                    channel_key = %key,
                    link = %link,
                    pending = report.remaining,
                    error = %e,
                    "Send failed; payload queued and channel reconnecting"
                );
                self.shared.lose_link(&entry, &mut handle, link).await;
                DispatchOutcome::Queued {
                    state: entry.state(),
                }
            }
        }
    }

    /// Current state; `Disconnected` for unknown keys.
    pub fn state(&self, key: &ChannelKey) -> ChannelState {
        self.shared
            .entry(key)
            .map(|entry| entry.state())
            .unwrap_or(ChannelState::Disconnected)
    }

    /// Follow state changes of an existing channel.
    pub fn watch_state(&self, key: &ChannelKey) -> Option<watch::Receiver<ChannelState>> {
        self.shared.entry(key).map(|entry| entry.state.subscribe())
    }

    /// Number of payloads waiting in the channel's outbound queue.
    pub async fn pending_count(&self, key: &ChannelKey) -> usize {
        match self.shared.entry(key) {
            Some(entry) => entry.handle.lock().await.queue.len(),
            None => 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.read().len()
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.shared.channels.read().keys().cloned().collect()
    }

    /// Hand out the channel's inbound queue. Succeeds once per channel.
    pub fn take_receiver(&self, key: &ChannelKey) -> Option<mpsc::Receiver<InboundMessage>> {
        self.shared.entry(key)?.inbound_rx.lock().take()
    }
}

#[async_trait]
impl ChannelDispatcher for ConnectionManager {
    async fn open(&self, key: &ChannelKey) -> ChannelState {
        self.connect(key).await
    }

    async fn dispatch(&self, key: &ChannelKey, payload: ChannelPayload) -> DispatchOutcome {
        ConnectionManager::dispatch(self, key, payload).await
    }
}
