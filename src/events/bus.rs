//! # Event bus for broadcasting runtime events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`]. Every component that changes
//! supervisor state (pool monitors, termination timers, router, dispatcher) publishes here.
//!
//! ## Architecture
//! ```text
//! Publishers (many):                      Receivers:
//!   worker monitors  ──┐
//!   escalation timers──┤
//!   router           ──┼──► Bus ──► subscriber_listener ──► SubscriberSet ──► LogWriter, …
//!   action monitors  ──┤  (broadcast)
//!   supervisor       ──┘          └──► Supervisor::events() (tests, embedding code)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never waits.
//! - **Bounded capacity**: one ring buffer for all receivers; a lagging receiver observes
//!   `RecvError::Lagged(n)` and skips the `n` oldest events.
//! - **No persistence**: with no receiver attached an event is simply dropped.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus; capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current receivers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver that observes events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
