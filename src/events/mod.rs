//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to publish/subscribe to
//! runtime events emitted by the supervisor, worker pool, router and action dispatcher.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `WorkerPool` monitors and escalation timers, `Router`,
//!   `ActionDispatcher` monitors, `Supervisor`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `Supervisor::subscriber_listener()` (fans out to `SubscriberSet`) and any
//!   receiver obtained through `Supervisor::events()`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
