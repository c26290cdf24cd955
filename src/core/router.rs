//! # Control message router.
//!
//! The router is the single consumer of the control channel. Workers, actions and in-process
//! requesters push `(origin, message)` [`Envelope`]s through a [`ControlSender`]; the router
//! dispatches each one by `message.kind`.
//!
//! ```text
//! worker monitor ─┐
//! action monitor ─┼─► ControlSender ──► [unbounded queue] ──► Router::run
//! Supervisor     ─┘                                             │
//!                               kind == "restart" ──────────────┤
//!                                 RestartRequested              │
//!                                 policy.reload().await         │
//!                                 spawn(restart.swap())         │
//!                               any other kind ─────────────────┘
//!                                 dispatcher.start_action(kind, params, origin)
//! ```
//!
//! The reload finishes before the next envelope is looked at, so every later message sees the
//! new dispatch table. The generation swap itself runs in the background.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{
    dispatcher::{ActionDispatcher, ActionId, ReplyTo},
    pool::WorkerId,
    restart::RestartProtocol,
};
use crate::error::{DispatchError, ProcessError};
use crate::events::{Bus, Event, EventKind};
use crate::message::{ControlMessage, Route};
use crate::process::ProcessHandle;

/// Who sent a control message; replies go back the same way.
#[derive(Clone, Debug)]
pub enum Origin {
    Worker {
        id: WorkerId,
        handle: ProcessHandle,
    },
    Action {
        id: ActionId,
        name: Arc<str>,
        handle: ProcessHandle,
    },
    /// In-process requester.
    Local {
        tx: mpsc::UnboundedSender<ControlMessage>,
    },
}

impl Origin {
    /// Sends a message back to this origin.
    pub fn deliver(&self, message: ControlMessage) -> Result<(), ProcessError> {
        match self {
            Origin::Worker { handle, .. } | Origin::Action { handle, .. } => handle.send(message),
            Origin::Local { tx } => tx.send(message).map_err(|_| ProcessError::Gone),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Worker { id, .. } => write!(f, "worker {id}"),
            Origin::Action { id, name, .. } => write!(f, "action {id} ({name})"),
            Origin::Local { .. } => f.write_str("local"),
        }
    }
}

/// One message on the control channel.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Origin,
    pub message: ControlMessage,
}

/// Producer side of the control channel.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ControlSender {
    /// Queues a message for the router; `false` once the router is gone.
    pub fn dispatch(&self, origin: Origin, message: ControlMessage) -> bool {
        self.tx.send(Envelope { origin, message }).is_ok()
    }
}

/// Creates the control channel.
pub fn channel() -> (ControlSender, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlSender { tx }, rx)
}

/// Dispatches control messages by kind.
pub struct Router {
    dispatcher: ActionDispatcher,
    restart: RestartProtocol,
    bus: Bus,
}

impl Router {
    pub(crate) fn new(dispatcher: ActionDispatcher, restart: RestartProtocol, bus: Bus) -> Self {
        Self {
            dispatcher,
            restart,
            bus,
        }
    }

    /// Routes envelopes until the token is cancelled or every sender is dropped.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => self.route(envelope).await,
                    None => break,
                },
            }
        }
        debug!("router stopped");
    }

    /// Handles one envelope.
    pub async fn route(&self, envelope: Envelope) {
        let Envelope { origin, message } = envelope;
        match message.route() {
            Route::Restart => {
                self.bus.publish(
                    Event::new(EventKind::RestartRequested).with_origin(origin.to_string()),
                );
                self.restart.reload().await;
                let restart = self.restart.clone();
                tokio::spawn(async move {
                    let _ = restart.swap().await;
                });
            }
            Route::Action { name, params } => {
                let reply_to = ReplyTo::new(origin, message.reference().cloned());
                let origin = reply_to.origin().to_string();
                match self.dispatcher.start_action(name, params, reply_to) {
                    Ok(_) => {}
                    Err(DispatchError::UnknownAction { name }) => {
                        warn!(action = %name, %origin, "no action registered; message dropped");
                        self.bus.publish(
                            Event::new(EventKind::ActionUnknown)
                                .with_action(name)
                                .with_origin(origin),
                        );
                    }
                    Err(err) => {
                        warn!(action = name, %origin, error = %err, "action not started");
                    }
                }
            }
        }
    }
}
