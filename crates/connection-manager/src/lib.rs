//! Live channel management.
//!
//! The [`ConnectionManager`] owns one channel per subscriber key. Each
//! channel runs a small state machine:
//!
//! ```text
//! disconnected -> connecting -> connected
//!                    |  ^           |
//!                    v  |      link lost
//!                  error <----------+
//!                    |
//!                    v
//!                 polling -> connected
//! ```
//!
//! A failed first attempt starts a background reconnection loop that follows
//! the connection backoff until its budget runs out; the channel then polls
//! at a fixed interval. Payloads dispatched while a channel is not connected
//! wait in its outbound queue and are flushed, in order, on connect.

mod config;
mod manager;
mod timers;

pub use config::ConnectionManagerConfig;
pub use manager::{ConnectionManager, InboundMessage};
