//! # Supervisor: wires the pool, router, dispatcher and event fan-out together.
//!
//! The [`Supervisor`] owns the event bus, a [`SubscriberSet`], the dispatch [`Policy`], the
//! [`WorkerPool`] and the router loop.
//!
//! ## High-level architecture
//! ```text
//! start():
//!   subscriber_listener(): Bus.subscribe() ─► SubscriberSet::emit(&Event)
//!   spawn(Router::run(control rx, runtime_token))
//!   policy.reload()                          (initial dispatch table)
//!   pool.spawn_pool(pool_size)               (generation 1, waits for listening)
//!
//! Control flow:
//!   worker / action / request() ─► ControlSender ─► Router
//!                                                    ├─ restart ─► RestartProtocol
//!                                                    └─ action  ─► ActionDispatcher
//!
//! Shutdown path:
//!   ShutdownSignals::recv()                  (registered before start)
//!             └─► Bus.publish(ShutdownRequested)
//!             └─► runtime_token.cancel()       (no more respawns, router stops)
//!             └─► pool.terminate_all()         (disconnect, then escalation timers)
//!             └─► wait up to cfg.grace for every worker to exit:
//!                    ├─ all exited  → Bus.publish(AllStoppedWithin)
//!                    └─ timeout     → Bus.publish(GraceExceeded), Err(GraceExceeded{stuck})
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use poolvisor::{Config, LogWriter, Subscribe, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), poolvisor::RuntimeError> {
//!     let mut cfg = Config::default();
//!     cfg.pool_size = 2;
//!
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = Supervisor::builder(cfg).with_subscribers(subs).build();
//!     sup.run().await
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{
    builder::SupervisorBuilder,
    config::Config,
    policy::Policy,
    pool::{Generation, WorkerId, WorkerPool},
    router::{ControlSender, Envelope, Origin, Router},
    shutdown::ShutdownSignals,
};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::message::ControlMessage;
use crate::subscribers::SubscriberSet;

/// Coordinates the worker pool, control routing, event delivery and graceful shutdown.
pub struct Supervisor {
    cfg: Config,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    policy: Arc<Policy>,
    pool: WorkerPool,
    control: ControlSender,
    router: Mutex<Option<(Router, mpsc::UnboundedReceiver<Envelope>)>>,
    runtime_token: CancellationToken,
}

impl Supervisor {
    /// Creates a builder.
    pub fn builder(cfg: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn new_internal(
        cfg: Config,
        bus: Bus,
        subs: Arc<SubscriberSet>,
        policy: Arc<Policy>,
        pool: WorkerPool,
        control: ControlSender,
        router: (Router, mpsc::UnboundedReceiver<Envelope>),
        runtime_token: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            bus,
            subs,
            policy,
            pool,
            control,
            router: Mutex::new(Some(router)),
            runtime_token,
        }
    }

    /// Starts event delivery and the router, loads the dispatch table and spawns the first
    /// generation. Returns once every worker of that generation is listening.
    pub async fn start(&self) -> Result<Generation, RuntimeError> {
        let (router, rx) = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RuntimeError::AlreadyStarted)?;

        self.subscriber_listener();
        tokio::spawn(router.run(rx, self.runtime_token.clone()));

        self.policy.reload().await?;
        self.pool.spawn_pool(self.pool.size()).await
    }

    /// Starts, then runs until an OS termination signal arrives and shuts down.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        let signals = ShutdownSignals::register();
        self.start().await?;
        match signals {
            Ok(mut signals) => {
                let signal = signals.recv().await;
                info!(%signal, "shutdown signal received");
            }
            Err(err) => warn!(error = %err, "signal handlers unavailable; shutting down"),
        }
        self.shutdown().await
    }

    /// Terminates every worker and waits up to [`Config::grace`] for all of them to exit.
    ///
    /// Publishes [`EventKind::AllStoppedWithin`] on success, or [`EventKind::GraceExceeded`]
    /// and returns [`RuntimeError::GraceExceeded`] with the stuck workers.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();

        let handles = self.pool.terminate_all(self.cfg.termination);
        let grace = self.cfg.grace;
        let done = join_all(handles.iter().map(|(_, h)| h.exited()));

        match tokio::time::timeout(grace, done).await {
            Ok(_) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<WorkerId> = handles
                    .iter()
                    .filter(|(_, h)| !h.has_exited())
                    .map(|(id, _)| *id)
                    .collect();
                self.bus
                    .publish(Event::new(EventKind::GraceExceeded).with_count(stuck.len()));
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Sends a control message as an in-process requester.
    ///
    /// Action replies arrive on the returned receiver. The receiver closes without a reply
    /// for `restart` and for unknown actions.
    pub fn request(&self, message: ControlMessage) -> mpsc::UnboundedReceiver<ControlMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.control.dispatch(Origin::Local { tx }, message);
        rx
    }

    /// Subscribes to the event bus.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Producer side of the control channel.
    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    fn subscriber_listener(&self) {
        if self.subs.is_empty() {
            return;
        }
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::policy::{ActionSpec, DispatchTable, StaticPolicy};
    use crate::core::pool::tests::{test_config, wait_until};
    use crate::message::Reply;
    use crate::process::fake::{FakeLauncher, WorkerBehavior};
    use crate::process::{CommandSpec, ENV_RECORD};
    use crate::record::RecordFile;

    fn supervisor(
        cfg: Config,
        launcher: &FakeLauncher,
        table: DispatchTable,
    ) -> Arc<Supervisor> {
        Supervisor::builder(cfg)
            .with_launcher(Arc::new(launcher.clone()))
            .with_policy(StaticPolicy(table))
            .build()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ControlMessage>) -> Option<ControlMessage> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_start_spawns_pool_once() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(test_config(4), &launcher, DispatchTable::new());

        let generation = sup.start().await.unwrap();
        assert_eq!(generation.number, 1);
        assert_eq!(sup.pool().len(), 4);
        assert_eq!(sup.pool().listening_count(), 4);

        let err = sup.start().await.unwrap_err();
        assert_eq!(err.as_label(), "runtime_already_started");
    }

    #[tokio::test]
    async fn test_update_writes_record_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(2);
        cfg.record = dir.path().join("data.json");

        let launcher = FakeLauncher::new();
        launcher.script("update", |action| async move {
            let file = RecordFile::new(action.param(ENV_RECORD).unwrap_or_default());
            let (Some(package), Some(version)) = (action.param("package"), action.param("version"))
            else {
                return 1;
            };
            if file.set_version(package, version).await.is_err() {
                return 1;
            }
            action.emit(ControlMessage::restart());
            0
        });
        let table = DispatchTable::new()
            .with_action("update", ActionSpec::new(CommandSpec::new("update")));
        let sup = supervisor(cfg.clone(), &launcher, table);
        let first = sup.start().await.unwrap();

        let mut replies = sup.request(
            ControlMessage::new("update")
                .with_field("package", "foo")
                .with_field("version", "2")
                .with_field("ref", 1),
        );
        let reply = recv(&mut replies).await.unwrap();
        assert_eq!(Reply::from_message(&reply), Some(Reply::Complete));
        assert_eq!(reply.reference(), Some(&serde_json::Value::from(1)));

        let record = RecordFile::new(&cfg.record).read().await.unwrap();
        assert_eq!(record.version("foo"), Some("2"));

        let pool = sup.pool().clone();
        wait_until(|| {
            pool.current_generation() == first.number + 1
                && pool.active().iter().all(|r| r.generation > first.number)
        })
        .await;
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_action_gets_no_reply() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(test_config(1), &launcher, DispatchTable::new());
        let mut events = sup.events();
        sup.start().await.unwrap();

        let mut replies = sup.request(ControlMessage::new("deploy"));
        assert_eq!(recv(&mut replies).await, None);
        assert!(launcher.actions().is_empty());

        let unknown = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = events.recv().await.unwrap();
                if ev.kind == EventKind::ActionUnknown {
                    break ev;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(unknown.action.as_deref(), Some("deploy"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_workers_without_respawn() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(test_config(3), &launcher, DispatchTable::new());
        sup.start().await.unwrap();

        sup.shutdown().await.unwrap();

        assert!(sup.pool().is_empty());
        let pool = sup.pool().clone();
        wait_until(|| pool.draining().is_empty()).await;
        assert_eq!(launcher.workers().len(), 3);
        assert!(launcher.workers().iter().all(|w| w.handle.has_exited()));
    }

    #[tokio::test]
    async fn test_shutdown_reports_stuck_workers() {
        let launcher = FakeLauncher::new();
        launcher.set_worker_behavior(WorkerBehavior {
            ignore_disconnect: true,
            ignore_terminate: true,
            ..WorkerBehavior::default()
        });
        let mut cfg = test_config(2);
        cfg.grace = Duration::from_millis(50);
        let sup = supervisor(cfg, &launcher, DispatchTable::new());
        let generation = sup.start().await.unwrap();

        match sup.shutdown().await {
            Err(RuntimeError::GraceExceeded { stuck, .. }) => {
                assert_eq!(stuck, generation.workers);
            }
            other => panic!("expected GraceExceeded, got {other:?}"),
        }
    }
}
