//! # Launching child processes.
//!
//! [`Launch`] is the seam between the supervisor and the operating system. The supervisor
//! describes *what* to start with a [`LaunchSpec`]; the launcher returns a [`Launched`] pair:
//! a [`ProcessHandle`] for control and an event stream of frames and the final exit.
//!
//! ```text
//! WorkerPool / ActionDispatcher ──► Launch::launch(LaunchSpec)
//!                                         │
//!                                         ├─► ProcessHandle   (send / signal / exited)
//!                                         └─► events: Frame … Frame, Exited(status)
//! ```

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::WorkerId;
use crate::error::ProcessError;

use super::handle::{ProcessEvent, ProcessHandle};

/// Program and arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// What kind of child is being started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Worker { id: WorkerId, generation: u64 },
    Action { name: Arc<str> },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Worker { id, generation } => write!(f, "worker {id} (generation {generation})"),
            Role::Action { name } => write!(f, "action {name}"),
        }
    }
}

/// Full description of one child to start.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub role: Role,
    pub command: CommandSpec,
    /// Extra environment on top of the inherited one.
    pub env: BTreeMap<String, String>,
}

/// A started child.
pub struct Launched {
    pub handle: ProcessHandle,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Starts child processes.
///
/// ### Implementation requirements
/// - Return as soon as the child is started; never wait for it.
/// - Deliver [`ProcessEvent::Exited`] exactly once, as the last event, after cancelling the
///   handle's exit token.
pub trait Launch: Send + Sync + 'static {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched, ProcessError>;
}
