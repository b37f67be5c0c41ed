//! FIFO buffer of undelivered payloads.

use chrono::{DateTime, Utc};
use realtime_core::{ChannelPayload, TransportError};
use std::collections::VecDeque;
use std::future::Future;
use tracing::{debug, warn};

/// A payload waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPayload {
    /// Position in enqueue order; increases for the life of the queue.
    pub sequence: u64,
    pub payload: ChannelPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlushReport {
    /// Entries handed to the transport and removed.
    pub delivered: usize,
    /// Entries still queued, starting with the one that failed.
    pub remaining: usize,
    /// The send error that stopped the flush, if any.
    pub error: Option<TransportError>,
}

impl FlushReport {
    /// True when every entry was delivered.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.remaining == 0
    }
}

/// Ordered outbound queue for one channel.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedPayload>,
    next_sequence: u64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload at the back. Returns its sequence number.
    pub fn enqueue(&mut self, payload: ChannelPayload) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.entries.push_back(QueuedPayload {
            sequence,
            payload,
            enqueued_at: Utc::now(),
        });

        debug!(sequence, pending = self.entries.len(), "Enqueued payload");
        sequence
    }

    /// Send queued payloads front to back.
    ///
    /// An entry is removed only after `send` succeeds for it. The first
    /// failure stops the flush and leaves that entry and everything behind
    /// it in place, in their original order.
    pub async fn flush<F, Fut>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(ChannelPayload) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let mut report = FlushReport::default();

        while let Some(front) = self.entries.front() {
            let sequence = front.sequence;
            match send(front.payload.clone()).await {
                Ok(()) => {
                    self.entries.pop_front();
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(sequence, error = %e, "Flush stopped at failed payload");
                    report.error = Some(e);
                    break;
                }
            }
        }

        report.remaining = self.entries.len();
        if report.delivered > 0 {
            debug!(
                delivered = report.delivered,
                remaining = report.remaining,
                "Flushed outbound queue"
            );
        }
        report
    }

    /// Drop every entry without sending. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedPayload> {
        self.entries.iter()
    }
}
