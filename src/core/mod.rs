//! Runtime core: worker pool, control routing and lifecycle.
//!
//! The public entry point is [`Supervisor`] (built with [`SupervisorBuilder`]). The other
//! public types are the handles it exposes.
//!
//! Internal modules:
//! - [`pool`]: active/draining worker collections, crash respawn;
//! - [`termination`]: disconnect, then terminate, then kill escalation;
//! - [`policy`]: dispatch table with atomic reload;
//! - [`dispatcher`]: one process per action, exactly one reply;
//! - [`router`]: the control channel and dispatch by message kind;
//! - [`restart`]: rolling generation swap;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod builder;
mod config;
mod dispatcher;
mod policy;
mod pool;
mod restart;
mod router;
mod shutdown;
mod supervisor;
mod termination;

pub use builder::SupervisorBuilder;
pub use config::Config;
pub use dispatcher::{ActionDispatcher, ActionId, ReplyTo, SPAWN_FAILED_CODE};
pub use policy::{ActionSpec, DispatchTable, FilePolicy, Policy, PolicySource, StaticPolicy};
pub use pool::{Generation, WorkerId, WorkerPool, WorkerRecord, WorkerState};
pub use restart::RestartProtocol;
pub use router::{ControlSender, Envelope, Origin, Router};
pub use supervisor::Supervisor;
pub use termination::TerminationPolicy;
