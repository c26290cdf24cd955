//! In-process launcher for tests.
//!
//! Workers report listening after `listen_delay`, exit 0 on `disconnect`, die with SIGTERM
//! or SIGKILL status on the matching signal and exit 1 when crashed through
//! [`FakeLauncher::crash`]. Actions run a registered script; an unregistered program
//! exits 127 the way a shell would.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::core::WorkerId;
use crate::error::ProcessError;
use crate::message::{ControlMessage, Frame};

use super::handle::{ExitStatus, ProcessEvent, ProcessHandle, Signal};
use super::launch::{CommandSpec, Launch, LaunchSpec, Launched, Role};

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// How launched workers behave.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorkerBehavior {
    pub listen_delay: Duration,
    pub ignore_disconnect: bool,
    pub ignore_terminate: bool,
}

impl Default for WorkerBehavior {
    fn default() -> Self {
        Self {
            listen_delay: Duration::from_millis(10),
            ignore_disconnect: false,
            ignore_terminate: false,
        }
    }
}

/// What a fake action sees.
pub(crate) struct FakeAction {
    pub env: BTreeMap<String, String>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl FakeAction {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Emits a control message towards the router.
    pub fn emit(&self, message: ControlMessage) {
        let _ = self.events.send(ProcessEvent::Frame(message.into()));
    }
}

pub(crate) type ActionScript = Arc<dyn Fn(FakeAction) -> BoxFuture<'static, i32> + Send + Sync>;

/// One child started by the fake launcher.
#[derive(Clone)]
pub(crate) struct FakeChild {
    pub role: Role,
    pub command: CommandSpec,
    pub env: BTreeMap<String, String>,
    pub handle: ProcessHandle,
    crash: CancellationToken,
    frames: Arc<Mutex<Vec<Frame>>>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl FakeChild {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        match self.role {
            Role::Worker { id, .. } => Some(id),
            Role::Action { .. } => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    worker: Mutex<WorkerBehavior>,
    actions: Mutex<HashMap<String, ActionScript>>,
    fail_spawn: AtomicBool,
    children: Mutex<Vec<FakeChild>>,
    next_pid: AtomicU32,
}

/// Cloneable fake launcher; clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    inner: Arc<Inner>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_worker_behavior(&self, behavior: WorkerBehavior) {
        *self.inner.worker.lock().unwrap() = behavior;
    }

    /// Registers an action script under a program name.
    pub fn script<F, Fut>(&self, program: &str, f: F)
    where
        F: Fn(FakeAction) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = i32> + Send + 'static,
    {
        let script: ActionScript = Arc::new(move |action| Box::pin(f(action)));
        self.inner
            .actions
            .lock()
            .unwrap()
            .insert(program.to_string(), script);
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.inner.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn children(&self) -> Vec<FakeChild> {
        self.inner.children.lock().unwrap().clone()
    }

    pub fn workers(&self) -> Vec<FakeChild> {
        self.children()
            .into_iter()
            .filter(|c| c.worker_id().is_some())
            .collect()
    }

    pub fn actions(&self) -> Vec<FakeChild> {
        self.children()
            .into_iter()
            .filter(|c| matches!(c.role, Role::Action { .. }))
            .collect()
    }

    pub fn worker(&self, id: WorkerId) -> Option<FakeChild> {
        self.children()
            .into_iter()
            .find(|c| c.worker_id() == Some(id))
    }

    /// Makes a worker exit with code 1 without being asked to.
    pub fn crash(&self, id: WorkerId) {
        if let Some(child) = self.worker(id) {
            child.crash.cancel();
        }
    }
}

impl Launch for FakeLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched, ProcessError> {
        if self.inner.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcessError::Spawn {
                program: spec.command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake spawn failure"),
            });
        }

        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = CancellationToken::new();
        let handle = ProcessHandle::new(Some(pid), frame_tx, signal_tx, exited.clone());

        let child = FakeChild {
            role: spec.role.clone(),
            command: spec.command.clone(),
            env: spec.env.clone(),
            handle: handle.clone(),
            crash: CancellationToken::new(),
            frames: Arc::default(),
            signals: Arc::default(),
        };
        self.inner.children.lock().unwrap().push(child.clone());

        match spec.role {
            Role::Worker { .. } => {
                let behavior = *self.inner.worker.lock().unwrap();
                tokio::spawn(run_worker(behavior, child, frame_rx, signal_rx, event_tx, exited));
            }
            Role::Action { .. } => {
                let program = spec.command.program.to_string_lossy().into_owned();
                let script = self.inner.actions.lock().unwrap().get(&program).cloned();
                let action = FakeAction {
                    env: spec.env,
                    events: event_tx.clone(),
                };
                tokio::spawn(run_action(script, action, child, signal_rx, event_tx, exited));
            }
        }

        Ok(Launched {
            handle,
            events: event_rx,
        })
    }
}

async fn run_worker(
    behavior: WorkerBehavior,
    child: FakeChild,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exited: CancellationToken,
) {
    let listen = time::sleep(behavior.listen_delay);
    tokio::pin!(listen);
    let mut listening = false;

    let status = loop {
        tokio::select! {
            _ = &mut listen, if !listening => {
                listening = true;
                let _ = events.send(ProcessEvent::Frame(Frame::Listening { addr: None }));
            }
            Some(frame) = frames.recv() => {
                child.frames.lock().unwrap().push(frame.clone());
                if frame == Frame::Disconnect && !behavior.ignore_disconnect {
                    break ExitStatus::from_code(0);
                }
            }
            Some(signal) = signals.recv() => {
                child.signals.lock().unwrap().push(signal);
                match signal {
                    Signal::Terminate if !behavior.ignore_terminate => {
                        break ExitStatus::from_signal(SIGTERM);
                    }
                    Signal::Kill => break ExitStatus::from_signal(SIGKILL),
                    Signal::Terminate => {}
                }
            }
            _ = child.crash.cancelled() => break ExitStatus::from_code(1),
        }
    };

    exited.cancel();
    let _ = events.send(ProcessEvent::Exited(status));
}

async fn run_action(
    script: Option<ActionScript>,
    action: FakeAction,
    child: FakeChild,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exited: CancellationToken,
) {
    let status = match script {
        None => ExitStatus::from_code(127),
        Some(script) => {
            let run = script(action);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    code = &mut run => break ExitStatus::from_code(code),
                    Some(signal) = signals.recv() => {
                        child.signals.lock().unwrap().push(signal);
                        match signal {
                            Signal::Terminate => break ExitStatus::from_signal(SIGTERM),
                            Signal::Kill => break ExitStatus::from_signal(SIGKILL),
                        }
                    }
                }
            }
        }
    };

    exited.cancel();
    let _ = events.send(ProcessEvent::Exited(status));
}
