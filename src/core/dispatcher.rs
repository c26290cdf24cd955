//! # Action dispatcher.
//!
//! Starts one process per action request and guarantees exactly one reply per started action.
//!
//! ```text
//! start_action(name, params, reply_to)
//!   ├─ Policy::current().lookup(name) ── UnknownAction ──► Err (no reply)
//!   ├─ Launch::launch(Role::Action)   ── failure ───────► reply error{127}, Err
//!   └─ monitor
//!        ├─ Frame::Message ──► ControlSender (router), origin = this action
//!        └─ Exited(status) ──► reply complete | error{code}
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{
    config::Config,
    policy::Policy,
    router::{ControlSender, Origin},
};
use crate::error::DispatchError;
use crate::events::{Bus, Event, EventKind};
use crate::message::{Frame, Reply};
use crate::process::{
    ENV_ACTION, ExitStatus, Launch, LaunchSpec, Launched, ProcessEvent, ProcessHandle, Role,
};

/// Status reported when a registered action cannot be started (shell "command not found").
pub const SPAWN_FAILED_CODE: i32 = 127;

/// Identity of one action process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Where an action's single reply goes.
pub struct ReplyTo {
    origin: Origin,
    reference: Option<Value>,
}

impl ReplyTo {
    /// `reference` is the request's correlation id, echoed in the reply.
    pub fn new(origin: Origin, reference: Option<Value>) -> Self {
        Self { origin, reference }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Delivers the reply; a requester that is gone is logged and otherwise ignored.
    fn send(self, reply: Reply) {
        let message = reply.to_message(self.reference.as_ref());
        if let Err(err) = self.origin.deliver(message) {
            debug!(origin = %self.origin, error = %err, "requester gone; reply dropped");
        }
    }
}

struct DispatcherInner {
    launcher: Arc<dyn Launch>,
    policy: Arc<Policy>,
    control: ControlSender,
    bus: Bus,
    env: BTreeMap<String, String>,
    next_id: AtomicU64,
}

/// Cloneable handle to the action dispatcher.
#[derive(Clone)]
pub struct ActionDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ActionDispatcher {
    pub(crate) fn new(
        cfg: &Config,
        launcher: Arc<dyn Launch>,
        policy: Arc<Policy>,
        control: ControlSender,
        bus: Bus,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                launcher,
                policy,
                control,
                bus,
                env: cfg.child_env(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Starts the action registered under `name`.
    ///
    /// `params` reach the process as environment variables, on top of the shared child
    /// environment and the action's own `env`. Messages the process emits are routed with the
    /// action as their origin. When it exits, `reply_to` receives exactly one reply.
    pub fn start_action(
        &self,
        name: &str,
        params: BTreeMap<String, String>,
        reply_to: ReplyTo,
    ) -> Result<ActionId, DispatchError> {
        let table = self.inner.policy.current();
        let spec = table.lookup(name)?;

        let id = ActionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let name: Arc<str> = Arc::from(name);

        let mut env = self.inner.env.clone();
        env.extend(spec.env.clone());
        env.extend(params);
        env.insert(ENV_ACTION.to_string(), name.to_string());

        let launched = self.inner.launcher.launch(LaunchSpec {
            role: Role::Action { name: name.clone() },
            command: spec.command.clone(),
            env,
        });
        let Launched { handle, events } = match launched {
            Ok(launched) => launched,
            Err(source) => {
                reply_to.send(Reply::Error {
                    code: SPAWN_FAILED_CODE,
                });
                self.inner.bus.publish(
                    Event::new(EventKind::ActionFailed)
                        .with_action(name.clone())
                        .with_code(SPAWN_FAILED_CODE)
                        .with_reason(source.to_string()),
                );
                return Err(DispatchError::Spawn {
                    name: name.to_string(),
                    source,
                });
            }
        };

        self.inner.bus.publish(
            Event::new(EventKind::ActionStarted)
                .with_action(name.clone())
                .with_pid(handle.pid())
                .with_origin(reply_to.origin().to_string()),
        );
        tokio::spawn(self.clone().monitor(id, name, handle, events, reply_to));
        Ok(id)
    }

    async fn monitor(
        self,
        id: ActionId,
        name: Arc<str>,
        handle: ProcessHandle,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        reply_to: ReplyTo,
    ) {
        let mut status = None;
        while let Some(ev) = events.recv().await {
            match ev {
                ProcessEvent::Frame(Frame::Message { message }) => {
                    let origin = Origin::Action {
                        id,
                        name: name.clone(),
                        handle: handle.clone(),
                    };
                    self.inner.control.dispatch(origin, message);
                }
                ProcessEvent::Frame(other) => {
                    debug!(action = %name, %id, frame = ?other, "ignoring frame from action");
                }
                ProcessEvent::Exited(s) => {
                    status = Some(s);
                    break;
                }
            }
        }

        let status = status.unwrap_or_else(ExitStatus::lost);
        let reply = Reply::from_code(status.code());
        reply_to.send(reply);

        let event = match reply {
            Reply::Complete => Event::new(EventKind::ActionCompleted),
            Reply::Error { code } => Event::new(EventKind::ActionFailed)
                .with_code(code)
                .with_reason(format!("exited with {status}")),
        };
        self.inner.bus.publish(event.with_action(name));
    }
}
