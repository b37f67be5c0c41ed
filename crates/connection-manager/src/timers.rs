//! Cancellable background tasks owned by one channel.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinHandle;

/// Boxed task body. Boxing keeps the mutually spawning tasks nameable.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// Reconnection loop, including the polling fallback.
    Reconnect,
    /// Reader forwarding link events to the inbound queue.
    Pump,
}

#[derive(Default)]
struct Slots {
    closed: bool,
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Slots {
    fn slot(&mut self, kind: TaskKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TaskKind::Reconnect => &mut self.reconnect,
            TaskKind::Pump => &mut self.pump,
        }
    }
}

/// At most one task of each kind; spawning replaces and aborts the previous one.
///
/// A task must never spawn into its own slot, since that would abort itself.
#[derive(Default)]
pub(crate) struct TaskSlot {
    slots: Mutex<Slots>,
}

impl TaskSlot {
    /// Spawn `task` unless the slot has been closed. Returns whether it was spawned.
    pub(crate) fn spawn(&self, kind: TaskKind, task: TaskFuture) -> bool {
        let mut slots = self.slots.lock();
        if slots.closed {
            return false;
        }

        let handle = tokio::spawn(task);
        if let Some(previous) = slots.slot(kind).replace(handle) {
            previous.abort();
        }
        true
    }

    /// Refuse further spawns, then abort and await every task.
    pub(crate) async fn close(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock();
            slots.closed = true;
            [slots.reconnect.take(), slots.pump.take()]
                .into_iter()
                .flatten()
                .collect()
        };

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self, kind: TaskKind) -> bool {
        self.slots
            .lock()
            .slot(kind)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
