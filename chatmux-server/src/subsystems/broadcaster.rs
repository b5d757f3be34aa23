//! Fan-out of session lifecycle and inbound-message events.
//!
//! One process-wide broadcast channel: `publish` never blocks the state
//! machines, events are not persisted or replayed, and a subscriber that
//! lags simply drops the oldest events (it re-fetches current state through
//! the registry on reconnect). Per-session publish order is preserved for
//! every subscriber because all events flow through the one channel.

use chatmux_core::Event;
use tokio::sync::broadcast;

pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget. A send error only means nobody is subscribed.
    pub fn publish(&self, event: Event) {
        tracing::debug!(
            session_id = event.session_id(),
            company_id = event.company_id(),
            "publishing event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
