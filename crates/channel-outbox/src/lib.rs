//! Outbound queue for channel payloads.
//!
//! Payloads dispatched while a channel is not connected wait here, in
//! order, until a flush hands them to the transport. The queue is owned by
//! a single channel handle and guarded by that handle's lock; it does no
//! locking of its own.

mod queue;

pub use queue::{FlushReport, OutboundQueue, QueuedPayload};
