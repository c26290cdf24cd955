//! # Child processes: launching, control handles and the IPC pipe.
//!
//! - [`Launch`] / [`LaunchSpec`] / [`Launched`] describe and start a child.
//! - [`ProcessHandle`] controls a running child (frames, signals, exit).
//! - [`OsLauncher`] runs real programs with newline-delimited JSON frames on stdin/stdout.
//! - [`link`] is the child's end of the pipe.
//!
//! Children receive their identity through the environment:
//!
//! | Variable | Set for | Value |
//! |---|---|---|
//! | `POOLVISOR_WORKER_ID` | workers | numeric worker id |
//! | `POOLVISOR_GENERATION` | workers | generation number |
//! | `POOLVISOR_ACTION` | actions | action name |
//! | `POOLVISOR_RECORD` | all | record file path |
//! | `POOLVISOR_LISTEN` | all | shared listen address |
//!
//! Action parameters are passed verbatim as additional variables.

mod handle;
mod launch;
pub mod link;
mod os;

#[cfg(test)]
pub(crate) mod fake;

pub use handle::{ExitStatus, ProcessEvent, ProcessHandle, Signal};
pub use launch::{CommandSpec, Launch, LaunchSpec, Launched, Role};
pub use os::OsLauncher;

pub const ENV_WORKER_ID: &str = "POOLVISOR_WORKER_ID";
pub const ENV_GENERATION: &str = "POOLVISOR_GENERATION";
pub const ENV_ACTION: &str = "POOLVISOR_ACTION";
pub const ENV_RECORD: &str = "POOLVISOR_RECORD";
pub const ENV_LISTEN: &str = "POOLVISOR_LISTEN";
