//! # poolvisor
//!
//! **Poolvisor** is a single-host process supervisor for Rust.
//!
//! It keeps a fixed-size pool of request-serving worker processes alive, swaps the whole pool
//! for a new generation without dropping serving capacity, and runs named "actions" as
//! short-lived subprocesses whose outcome is replied to whoever asked for them.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   ┌──────────┐ ┌──────────┐ ┌──────────┐        ┌──────────────┐
//!   │ worker 1 │ │ worker 2 │ │ worker N │        │ action (a1)  │
//!   │  gen g   │ │  gen g   │ │  gen g   │        │  "update"    │
//!   └────┬─────┘ └────┬─────┘ └────┬─────┘        └──────┬───────┘
//!        │ frames (stdin/stdout, newline-delimited JSON)  │
//!        ▼            ▼            ▼                      ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - WorkerPool (active + draining workers, crash respawn)          │
//! │  - Router (single consumer of the control channel)                │
//! │  - ActionDispatcher (one process per action, exactly one reply)   │
//! │  - RestartProtocol (new generation listening → old one retired)   │
//! │  - Policy (ArcSwap dispatch table, reloaded on restart)           │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//!                    subscriber_listener ─► SubscriberSet
//!                                        ┌─────────┼─────────┐
//!                                        ▼         ▼         ▼
//!                                    LogWriter   sub 2     sub N
//! ```
//!
//! ### Control flow
//! ```text
//! {kind:"update", package, version} ──► Router
//!     └─► ActionDispatcher::start_action("update")
//!           └─► action process: write record, emit {kind:"restart"}, exit 0
//!                 ├─► Router: restart ─► reload policy ─► RestartProtocol
//!                 │       spawn_pool(N) ── all listening ──► terminate old workers
//!                 └─► reply {kind:"complete"} to the requester
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                       |
//! |-------------------|----------------------------------------------------------|------------------------------------------|
//! | **Supervision**   | Pool lifecycle, rolling restart, graceful shutdown.      | [`Supervisor`], [`WorkerPool`]           |
//! | **Termination**   | Disconnect, then terminate, then kill.                   | [`TerminationPolicy`]                    |
//! | **Dispatch**      | Named actions as subprocesses, reloadable registry.      | [`DispatchTable`], [`PolicySource`]      |
//! | **Processes**     | Pluggable launcher and child-side pipe.                  | [`Launch`], [`OsLauncher`], [`process::link`] |
//! | **Subscriber API**| Hook into lifecycle events (logging, metrics).           | [`Subscribe`], [`LogWriter`]             |
//! | **Errors**        | Typed errors with stable labels.                         | [`RuntimeError`], [`DispatchError`]      |
//! | **Configuration** | Centralized settings, TOML loadable.                     | [`Config`]                               |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use poolvisor::{Config, ControlMessage, LogWriter, Subscribe, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.pool_size = 4;
//!
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = Supervisor::builder(cfg).with_subscribers(subs).build();
//!
//!     let generation = sup.start().await?;
//!     println!("generation {} is listening", generation.number);
//!
//!     // Ask for an update and wait for the action's reply.
//!     let mut replies = sup.request(
//!         ControlMessage::new("update")
//!             .with_field("package", "foo")
//!             .with_field("version", "2"),
//!     );
//!     if let Some(reply) = replies.recv().await {
//!         println!("update finished: {}", reply.kind);
//!     }
//!
//!     sup.shutdown().await?;
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod message;
pub mod process;
mod record;
pub mod service;
mod subscribers;

// ---- Public re-exports ----

pub use core::{
    ActionDispatcher, ActionId, ActionSpec, Config, ControlSender, DispatchTable, Envelope,
    FilePolicy, Generation, Origin, Policy, PolicySource, ReplyTo, RestartProtocol, Router,
    SPAWN_FAILED_CODE, StaticPolicy, Supervisor, SupervisorBuilder, TerminationPolicy, WorkerId,
    WorkerPool, WorkerRecord, WorkerState,
};
pub use error::{
    ConfigError, DispatchError, PolicyError, ProcessError, RecordError, RuntimeError,
    ServiceError,
};
pub use events::{Bus, Event, EventKind};
pub use message::{COMPLETE, ControlMessage, ERROR, Frame, RESTART, Reply, Route};
pub use process::{CommandSpec, ExitStatus, Launch, LaunchSpec, Launched, OsLauncher, ProcessHandle};
pub use record::{Record, RecordFile};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
