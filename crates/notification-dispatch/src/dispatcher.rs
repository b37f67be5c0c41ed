//! Preference-aware notification fan-out.

use crate::{NotificationRenderer, RateLimiter};
use realtime_core::{
    ChannelDispatcher, ChannelKey, ChannelPayload, DeliveryError, DeliveryPreferences,
    DispatchOutcome, EmailSender, NotificationChannel, SettingsProvider, SmsSender,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event name of realtime notification payloads.
const NOTIFICATION_EVENT: &str = "notification";

/// What to tell the subject, and where to reach them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    /// App path or absolute URL the notification points at.
    #[serde(default)]
    pub link: Option<String>,
    /// Recipient address for the email channel.
    #[serde(default)]
    pub email: Option<String>,
    /// Recipient number for the sms channel.
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDeliveryStatus {
    Sent,
    /// Realtime only: queued until the subject's channel reconnects.
    Queued,
    /// Not attempted; `skip_reason` says why.
    Skipped,
    Failed,
}

/// Result for one requested channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDelivery {
    pub channel: NotificationChannel,
    pub status: ChannelDeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl ChannelDelivery {
    fn sent(channel: NotificationChannel) -> Self {
        Self {
            channel,
            status: ChannelDeliveryStatus::Sent,
            error: None,
            skip_reason: None,
        }
    }

    fn skipped(channel: NotificationChannel, reason: &str) -> Self {
        Self {
            channel,
            status: ChannelDeliveryStatus::Skipped,
            error: None,
            skip_reason: Some(reason.to_string()),
        }
    }

    fn failed(channel: NotificationChannel, error: DeliveryError) -> Self {
        Self {
            channel,
            status: ChannelDeliveryStatus::Failed,
            error: Some(error),
            skip_reason: None,
        }
    }
}

/// Sends notifications over realtime, email, and sms.
pub struct NotificationDispatcher {
    settings: Arc<dyn SettingsProvider>,
    channels: Arc<dyn ChannelDispatcher>,
    email: Arc<dyn EmailSender>,
    sms: Option<Arc<dyn SmsSender>>,
    rate_limiter: Arc<RateLimiter>,
    renderer: NotificationRenderer,
}

impl NotificationDispatcher {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        channels: Arc<dyn ChannelDispatcher>,
        email: Arc<dyn EmailSender>,
        rate_limiter: Arc<RateLimiter>,
        renderer: NotificationRenderer,
    ) -> Self {
        Self {
            settings,
            channels,
            email,
            sms: None,
            rate_limiter,
            renderer,
        }
    }

    /// Enable the sms channel.
    pub fn with_sms(mut self, sms: Arc<dyn SmsSender>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Deliver one notification over each requested channel, in order.
    ///
    /// Missing preferences mean everything is enabled. A disabled category
    /// skips every channel.
    pub async fn dispatch_notification(
        &self,
        subject_id: &str,
        category: &str,
        payload: &NotificationPayload,
        channels: &[NotificationChannel],
    ) -> Vec<ChannelDelivery> {
        let preferences = self
            .settings
            .get_delivery_preferences(subject_id)
            .await
            .unwrap_or_default();

        if !preferences.allows_category(category) {
            debug!(subject_id, category, "Notification category disabled");
            return channels
                .iter()
                .map(|&channel| ChannelDelivery::skipped(channel, "category disabled"))
                .collect();
        }

        let mut results = Vec::with_capacity(channels.len());
        for &channel in channels {
            let result = self
                .deliver(subject_id, category, payload, channel, &preferences)
                .await;
            debug!(
                subject_id,
                category,
                channel = %channel,
                status = ?result.status,
                "Notification channel handled"
            );
            results.push(result);
        }

        info!(
            subject_id,
            category,
            sent = results
                .iter()
                .filter(|r| r.status == ChannelDeliveryStatus::Sent)
                .count(),
            "Notification dispatched"
        );
        results
    }

    async fn deliver(
        &self,
        subject_id: &str,
        category: &str,
        payload: &NotificationPayload,
        channel: NotificationChannel,
        preferences: &DeliveryPreferences,
    ) -> ChannelDelivery {
        if !preferences.allows_channel(channel) {
            return ChannelDelivery::skipped(channel, "disabled in preferences");
        }

        match channel {
            NotificationChannel::Realtime => self.deliver_realtime(subject_id, category, payload).await,
            NotificationChannel::Email => self.deliver_email(subject_id, payload).await,
            NotificationChannel::Sms => self.deliver_sms(payload).await,
        }
    }

    async fn deliver_realtime(
        &self,
        subject_id: &str,
        category: &str,
        payload: &NotificationPayload,
    ) -> ChannelDelivery {
        let key = ChannelKey::notifications(subject_id);
        self.channels.open(&key).await;

        let body = json!({
            "category": category,
            "title": payload.title,
            "body": payload.body,
            "link": payload.link,
        });

        match self
            .channels
            .dispatch(&key, ChannelPayload::new(NOTIFICATION_EVENT, body))
            .await
        {
            DispatchOutcome::Sent => ChannelDelivery::sent(NotificationChannel::Realtime),
            DispatchOutcome::Queued { .. } => ChannelDelivery {
                status: ChannelDeliveryStatus::Queued,
                ..ChannelDelivery::sent(NotificationChannel::Realtime)
            },
            DispatchOutcome::Failed(failure) => {
                ChannelDelivery::failed(NotificationChannel::Realtime, failure.into())
            }
        }
    }

    async fn deliver_email(&self, subject_id: &str, payload: &NotificationPayload) -> ChannelDelivery {
        let channel = NotificationChannel::Email;
        let Some(to) = payload.email.as_deref().filter(|to| !to.trim().is_empty()) else {
            return ChannelDelivery::skipped(channel, "no email address");
        };

        if !self.rate_limiter.admit(subject_id) {
            warn!(subject_id, "Email notification rate limited");
            return ChannelDelivery::failed(
                channel,
                DeliveryError::RateLimited(format!(
                    "more than {} emails in {}s",
                    self.rate_limiter.config().max_per_window,
                    self.rate_limiter.config().window.as_secs()
                )),
            );
        }

        let email = self.renderer.email(to, payload);
        match self.email.send(&email).await {
            Ok(receipt) => {
                debug!(subject_id, email_id = %receipt.id, "Notification email sent");
                ChannelDelivery::sent(channel)
            }
            Err(e) => {
                warn!(subject_id, error = %e, "Notification email failed");
                ChannelDelivery::failed(channel, e.into())
            }
        }
    }

    async fn deliver_sms(&self, payload: &NotificationPayload) -> ChannelDelivery {
        let channel = NotificationChannel::Sms;
        let Some(sender) = &self.sms else {
            return ChannelDelivery::skipped(channel, "sms not configured");
        };
        let Some(to) = payload.phone.as_deref().filter(|to| !to.trim().is_empty()) else {
            return ChannelDelivery::skipped(channel, "no phone number");
        };

        match sender.send(&self.renderer.sms(to, payload)).await {
            Ok(_) => ChannelDelivery::sent(channel),
            Err(e) => {
                warn!(error = %e, "Notification sms failed");
                ChannelDelivery::failed(channel, e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RateLimiterConfig;
    use connection_manager::ConnectionManager;
    use realtime_core::memory::{
        InMemorySettings, RecordingEmailSender, RecordingSmsSender, ScriptedTransport,
    };
    use std::collections::HashMap;

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        settings: Arc<InMemorySettings>,
        email: Arc<RecordingEmailSender>,
        sms: Arc<RecordingSmsSender>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let settings = Arc::new(InMemorySettings::new());
        let email = Arc::new(RecordingEmailSender::new());
        let sms = Arc::new(RecordingSmsSender::new());
        let manager = Arc::new(ConnectionManager::with_defaults(transport.clone()));

        let dispatcher = NotificationDispatcher::new(
            settings.clone(),
            manager,
            email.clone(),
            Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            NotificationRenderer::default(),
        )
        .with_sms(sms.clone());

        Fixture {
            transport,
            settings,
            email,
            sms,
            dispatcher,
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            title: "Consultation booked".to_string(),
            body: "Tuesday 10:00".to_string(),
            link: Some("/consultations/42".to_string()),
            email: Some("client@example.com".to_string()),
            phone: Some("+15550100".to_string()),
        }
    }

    const ALL: [NotificationChannel; 3] = [
        NotificationChannel::Realtime,
        NotificationChannel::Email,
        NotificationChannel::Sms,
    ];

    fn statuses(results: &[ChannelDelivery]) -> Vec<ChannelDeliveryStatus> {
        results.iter().map(|r| r.status).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_defaults_enable_every_channel() {
        let f = fixture();

        let results = f
            .dispatcher
            .dispatch_notification("user-1", "consultation", &payload(), &ALL)
            .await;

        assert_eq!(
            statuses(&results),
            vec![ChannelDeliveryStatus::Sent; 3]
        );
        let realtime = f.transport.sent_to(&ChannelKey::notifications("user-1"));
        assert_eq!(realtime.len(), 1);
        assert_eq!(realtime[0].event, "notification");
        assert_eq!(realtime[0].body["category"], "consultation");
        assert_eq!(f.email.sent()[0].to, "client@example.com");
        assert_eq!(f.sms.sent()[0].to, "+15550100");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_category_skips_everything() {
        let f = fixture();
        f.settings.set_preferences(
            "user-1",
            DeliveryPreferences {
                per_category_flags: HashMap::from([("marketing".to_string(), false)]),
                ..Default::default()
            },
        );

        let results = f
            .dispatcher
            .dispatch_notification("user-1", "marketing", &payload(), &ALL)
            .await;

        assert_eq!(statuses(&results), vec![ChannelDeliveryStatus::Skipped; 3]);
        assert_eq!(f.transport.total_calls(), 0);
        assert_eq!(f.email.attempts(), 0);
        assert!(f.sms.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_preferences_are_honored() {
        let f = fixture();
        f.settings.set_preferences(
            "user-1",
            DeliveryPreferences {
                email_enabled: false,
                sms_enabled: false,
                ..Default::default()
            },
        );

        let results = f
            .dispatcher
            .dispatch_notification("user-1", "consultation", &payload(), &ALL)
            .await;

        assert_eq!(
            statuses(&results),
            vec![
                ChannelDeliveryStatus::Sent,
                ChannelDeliveryStatus::Skipped,
                ChannelDeliveryStatus::Skipped
            ]
        );
        assert_eq!(
            results[1].skip_reason.as_deref(),
            Some("disabled in preferences")
        );
        assert_eq!(f.email.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_email_rate_limit_blocks_provider_calls() {
        let f = fixture();
        let email_only = [NotificationChannel::Email];

        for _ in 0..5 {
            let results = f
                .dispatcher
                .dispatch_notification("user-1", "consultation", &payload(), &email_only)
                .await;
            assert_eq!(results[0].status, ChannelDeliveryStatus::Sent);
        }

        let results = f
            .dispatcher
            .dispatch_notification("user-1", "consultation", &payload(), &email_only)
            .await;
        assert_eq!(results[0].status, ChannelDeliveryStatus::Failed);
        assert!(matches!(
            results[0].error,
            Some(DeliveryError::RateLimited(_))
        ));
        assert_eq!(f.email.attempts(), 5);

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        let results = f
            .dispatcher
            .dispatch_notification("user-1", "consultation", &payload(), &email_only)
            .await;
        assert_eq!(results[0].status, ChannelDeliveryStatus::Sent);
        assert_eq!(f.email.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_recipients_are_skipped() {
        let f = fixture();
        let bare = NotificationPayload {
            email: None,
            phone: Some("  ".to_string()),
            ..payload()
        };

        let results = f
            .dispatcher
            .dispatch_notification(
                "user-1",
                "consultation",
                &bare,
                &[NotificationChannel::Email, NotificationChannel::Sms],
            )
            .await;

        assert_eq!(statuses(&results), vec![ChannelDeliveryStatus::Skipped; 2]);
        assert_eq!(f.dispatcher.rate_limiter().remaining("user-1"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_is_reported() {
        let f = fixture();
        f.email.fail_next(1);

        let results = f
            .dispatcher
            .dispatch_notification("user-1", "consultation", &payload(), &[NotificationChannel::Email])
            .await;

        assert_eq!(results[0].status, ChannelDeliveryStatus::Failed);
        assert!(matches!(results[0].error, Some(DeliveryError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_queued_while_reconnecting() {
        let f = fixture();
        f.transport.fail_next_opens(1);

        let results = f
            .dispatcher
            .dispatch_notification(
                "user-1",
                "consultation",
                &payload(),
                &[NotificationChannel::Realtime],
            )
            .await;

        assert_eq!(results[0].status, ChannelDeliveryStatus::Queued);

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(
            f.transport
                .sent_to(&ChannelKey::notifications("user-1"))
                .len(),
            1
        );
    }
}
