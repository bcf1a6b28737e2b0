//! Driver events and their subscriber list.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::debug;

/// Raised by the helper when the bot stops on its own.
pub const BOT_STOPPED: &str = "OnBotStopped";
/// Raised by the helper when the driver wants to shut down.
pub const SHUTDOWN_REQUESTED: &str = "OnShutdownRequested";

/// Named event raised by the driver-side helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverEvent {
    /// Event name, e.g. [`BOT_STOPPED`].
    pub name: String,
    /// Free-form payload.
    pub data: String,
}

impl DriverEvent {
    /// Build an event.
    #[must_use]
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Whether this is [`BOT_STOPPED`].
    #[must_use]
    pub fn is_bot_stopped(&self) -> bool {
        self.name == BOT_STOPPED
    }

    /// Whether this is [`SHUTDOWN_REQUESTED`].
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.name == SHUTDOWN_REQUESTED
    }
}

#[derive(Debug, Default)]
struct BusState {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<DriverEvent>)>,
    closed: bool,
}

/// Explicit subscriber list. Closing it ends every subscription, which is
/// how subscribers learn that the connection is gone.
#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    /// New, open bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber. On a closed bus the subscription is already ended.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.push((id, tx));
        }
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every subscriber; returns how many received it.
    pub fn publish(&self, event: &DriverEvent) -> usize {
        let mut state = self.state();
        if state.closed {
            return 0;
        }
        state
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        debug!(event = %event.name, subscribers = state.subscribers.len(), "event published");
        state.subscribers.len()
    }

    /// End all subscriptions; later publishes are dropped.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Live subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.state().subscribers.retain(|(sid, _)| *sid != id);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DriverEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Next event; `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<DriverEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<DriverEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
