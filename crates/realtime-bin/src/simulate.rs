//! In-process run of the delivery engine against scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use realtime_config_and_utils::Config;
use realtime_core::memory::{
    InMemorySettings, InMemoryStorage, RecordingEmailSender, RecordingSmsSender, ScriptedTransport,
};
use realtime_core::{ChannelKey, ChannelState, NewMessage, NotificationChannel};
use realtime_service::{
    ChannelDelivery, DeliveryReport, NotificationPayload, RealtimeService, ServiceResult,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Consultation whose channel carries the messages
    #[arg(long, default_value = "demo")]
    consultation: String,

    /// Number of messages to send
    #[arg(long, default_value_t = 3)]
    messages: usize,

    /// Channel opens that fail before the transport recovers
    #[arg(long, default_value_t = 1)]
    fail_opens: u32,

    /// Seconds to wait for queued messages to drain
    #[arg(long, default_value_t = 60)]
    drain_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    channel: ChannelKey,
    final_state: ChannelState,
    reports: Vec<DeliveryReport>,
    notification: Vec<ChannelDelivery>,
    transport_sends: usize,
    emails_sent: usize,
}

pub async fn run(config: Config, args: SimulateArgs) -> ServiceResult<SimulationSummary> {
    let transport = Arc::new(ScriptedTransport::new());
    let storage = Arc::new(InMemoryStorage::new());
    let email = Arc::new(RecordingEmailSender::new());
    transport.fail_next_opens(args.fail_opens);

    let service = RealtimeService::builder(config)
        .transport(transport.clone())
        .storage(storage)
        .settings(Arc::new(InMemorySettings::new()))
        .email(email.clone())
        .sms(Arc::new(RecordingSmsSender::new()))
        .build()?;
    service.start_sweeper();

    let channel = ChannelKey::consultation(&args.consultation);
    let initial = service.connect(&channel).await;
    info!(channel = %channel, state = %initial, "Channel requested");

    let mut reports = Vec::with_capacity(args.messages);
    for n in 1..=args.messages {
        let report = service
            .send_message(NewMessage {
                channel_key: channel.clone(),
                sender_id: "simulator".to_string(),
                content: format!("Simulated message {n}"),
            })
            .await;
        info!(n, status = ?report.status, "Message submitted");
        reports.push(report);
    }

    wait_for_connected(&service, &channel, Duration::from_secs(args.drain_timeout)).await;

    let notification = service
        .dispatch_notification(
            "simulator",
            "consultation",
            &NotificationPayload {
                title: "Simulation finished".to_string(),
                body: format!("{} messages submitted", args.messages),
                link: Some(format!("/consultations/{}", args.consultation)),
                email: Some("simulator@example.com".to_string()),
                phone: None,
            },
            &[NotificationChannel::Realtime, NotificationChannel::Email],
        )
        .await;

    let final_state = service.get_connection_state(&channel);
    service.shutdown().await;

    Ok(SimulationSummary {
        channel: channel.clone(),
        final_state,
        reports,
        notification,
        transport_sends: transport.sent_to(&channel).len(),
        emails_sent: email.sent().len(),
    })
}

async fn wait_for_connected(service: &RealtimeService, channel: &ChannelKey, timeout: Duration) {
    let Some(mut state) = service.watch_connection_state(channel) else {
        return;
    };
    let connected = tokio::time::timeout(timeout, state.wait_for(|s| *s == ChannelState::Connected));
    if connected.await.is_err() {
        warn!(channel = %channel, timeout_secs = timeout.as_secs(), "Channel did not reconnect in time");
    }
}
