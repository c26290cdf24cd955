//! # Worker pool: the set of auto-replaceable worker processes.
//!
//! [`WorkerPool`] owns the **active** collection (workers eligible for replacement) and the
//! **draining** collection (workers handed to termination). Each launched worker gets a
//! monitor task that consumes its [`ProcessEvent`]s.
//!
//! ## Architecture
//! ```text
//! spawn_pool(n) ──► spawn_worker() × n ──► Launch::launch()
//!      │                                        │
//!      │ (waits for n ready signals)            ▼
//!      │                                  monitor(worker)
//!      │                                   ├─ Listening ──► state=Listening, fire ready
//!      │◄──────────────────────────────────┘
//!      │                                   ├─ Message   ──► ControlSender (router)
//!      │                                   └─ Exited    ──► on_exit()
//!      │                                                      ├─ was active → WorkerCrashed
//!      ▼                                                      │               spawn_worker()
//! Generation { number, workers }                              └─ draining   → forget
//! ```
//!
//! ## Rules
//! - A worker removed from `active` never triggers a replacement.
//! - A replacement keeps the generation of the worker it replaces.
//! - A replacement for a worker that crashed before listening inherits its ready signal, so
//!   `spawn_pool` keeps waiting for the replacement instead of failing.
//! - Respawning stops once the runtime token is cancelled (shutdown).

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::try_join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{
    config::Config,
    policy::Policy,
    router::{ControlSender, Origin},
    termination::TerminationPolicy,
};
use crate::error::{ProcessError, RuntimeError};
use crate::events::{Bus, Event, EventKind};
use crate::message::Frame;
use crate::process::{
    CommandSpec, ENV_GENERATION, ENV_WORKER_ID, ExitStatus, Launch, LaunchSpec, Launched,
    ProcessEvent, ProcessHandle, Role,
};

/// Identity of one worker process; never reused within a supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Lifecycle of a worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Launched, not yet serving.
    Spawning,
    /// Reported listening.
    Listening,
    /// Unregistered and told to disconnect; escalation timers running.
    Terminating,
    /// Exited.
    Terminated,
}

/// Snapshot of one worker.
#[derive(Clone, Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub generation: u64,
    pub state: WorkerState,
    pub handle: ProcessHandle,
}

/// A cohort of workers spawned together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub number: u64,
    pub workers: Vec<WorkerId>,
}

struct Entry {
    record: WorkerRecord,
    ready: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Workers {
    active: BTreeMap<WorkerId, Entry>,
    draining: BTreeMap<WorkerId, WorkerRecord>,
}

struct PoolInner {
    launcher: Arc<dyn Launch>,
    bus: Bus,
    control: ControlSender,
    policy: Arc<Policy>,
    worker: CommandSpec,
    env: BTreeMap<String, String>,
    size: usize,
    termination: TerminationPolicy,
    workers: Mutex<Workers>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    current_generation: AtomicU64,
    token: CancellationToken,
}

/// Cloneable handle to the worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(
        cfg: &Config,
        launcher: Arc<dyn Launch>,
        bus: Bus,
        control: ControlSender,
        policy: Arc<Policy>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                bus,
                control,
                policy,
                worker: cfg.worker.clone(),
                env: cfg.child_env(),
                size: cfg.pool_size_clamped(),
                termination: cfg.termination,
                workers: Mutex::new(Workers::default()),
                next_id: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                current_generation: AtomicU64::new(0),
                token,
            }),
        }
    }

    /// Spawns `n` workers of a new generation and waits until every one is listening.
    ///
    /// Fails with [`RuntimeError::Spawn`] when a launch fails and with
    /// [`RuntimeError::GenerationLost`] when a worker of the generation is terminated (or its
    /// replacement cannot be launched) before it listens. On failure the partial generation
    /// is handed to termination.
    pub async fn spawn_pool(&self, n: usize) -> Result<Generation, RuntimeError> {
        let number = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.bus.publish(
            Event::new(EventKind::GenerationStarting)
                .with_generation(number)
                .with_count(n),
        );

        let mut waits = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = oneshot::channel();
            if let Err(err) = self.spawn_worker(number, Some(tx)) {
                self.publish_spawn_failed(number, &err);
                self.retire_generation(number);
                return Err(err.into());
            }
            waits.push(rx);
        }

        if try_join_all(waits).await.is_err() {
            self.retire_generation(number);
            return Err(RuntimeError::GenerationLost { generation: number });
        }

        self.inner
            .current_generation
            .fetch_max(number, Ordering::SeqCst);
        self.inner.bus.publish(
            Event::new(EventKind::GenerationListening)
                .with_generation(number)
                .with_count(n),
        );

        Ok(Generation {
            number,
            workers: self.ids_where(|r| r.generation == number),
        })
    }

    /// Launches one worker and registers it as auto-replaceable.
    fn spawn_worker(
        &self,
        generation: u64,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<WorkerId, ProcessError> {
        let id = WorkerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        let mut env = self.inner.env.clone();
        env.insert(ENV_WORKER_ID.to_string(), id.get().to_string());
        env.insert(ENV_GENERATION.to_string(), generation.to_string());

        let Launched { handle, events } = self.inner.launcher.launch(LaunchSpec {
            role: Role::Worker { id, generation },
            command: self.worker_command(),
            env,
        })?;

        self.lock().active.insert(
            id,
            Entry {
                record: WorkerRecord {
                    id,
                    generation,
                    state: WorkerState::Spawning,
                    handle: handle.clone(),
                },
                ready,
            },
        );
        self.inner.bus.publish(
            Event::new(EventKind::WorkerSpawned)
                .with_worker(id)
                .with_generation(generation)
                .with_pid(handle.pid()),
        );

        tokio::spawn(self.clone().monitor(id, generation, handle, events));
        Ok(id)
    }

    async fn monitor(
        self,
        id: WorkerId,
        generation: u64,
        handle: ProcessHandle,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let mut status = None;
        while let Some(ev) = events.recv().await {
            match ev {
                ProcessEvent::Frame(Frame::Listening { .. }) => self.mark_listening(id, generation),
                ProcessEvent::Frame(Frame::Message { message }) => {
                    let origin = Origin::Worker {
                        id,
                        handle: handle.clone(),
                    };
                    self.inner.control.dispatch(origin, message);
                }
                ProcessEvent::Frame(Frame::Disconnect) => {
                    debug!(worker = %id, "ignoring disconnect frame sent by worker");
                }
                ProcessEvent::Exited(s) => {
                    status = Some(s);
                    break;
                }
            }
        }
        self.on_exit(id, generation, status.unwrap_or_else(ExitStatus::lost));
    }

    fn mark_listening(&self, id: WorkerId, generation: u64) {
        let ready = {
            let mut workers = self.lock();
            match workers.active.get_mut(&id) {
                Some(entry) => {
                    entry.record.state = WorkerState::Listening;
                    entry.ready.take()
                }
                None => return,
            }
        };
        self.inner.bus.publish(
            Event::new(EventKind::WorkerListening)
                .with_worker(id)
                .with_generation(generation),
        );
        if let Some(tx) = ready {
            let _ = tx.send(());
        }
    }

    fn on_exit(&self, id: WorkerId, generation: u64, status: ExitStatus) {
        let removed = {
            let mut workers = self.lock();
            workers.draining.remove(&id);
            workers.active.remove(&id)
        };
        self.inner.bus.publish(
            Event::new(EventKind::WorkerExited)
                .with_worker(id)
                .with_generation(generation)
                .with_code(status.code()),
        );

        let Some(entry) = removed else {
            return;
        };
        if self.inner.token.is_cancelled() {
            return;
        }

        self.inner.bus.publish(
            Event::new(EventKind::WorkerCrashed)
                .with_worker(id)
                .with_generation(generation),
        );
        if let Err(err) = self.spawn_worker(generation, entry.ready) {
            self.publish_spawn_failed(generation, &err);
        }
    }

    fn publish_spawn_failed(&self, generation: u64, err: &ProcessError) {
        self.inner.bus.publish(
            Event::new(EventKind::WorkerSpawnFailed)
                .with_generation(generation)
                .with_reason(err.to_string()),
        );
    }

    /// Worker command of the current dispatch table, or the configured default.
    fn worker_command(&self) -> CommandSpec {
        self.inner
            .policy
            .current()
            .worker
            .clone()
            .unwrap_or_else(|| self.inner.worker.clone())
    }

    /// Moves a worker from `active` to `draining`; `None` if it is not active.
    pub(super) fn unregister(&self, id: WorkerId) -> Option<WorkerRecord> {
        let mut workers = self.lock();
        let entry = workers.active.remove(&id)?;
        let mut record = entry.record;
        record.state = WorkerState::Terminating;
        workers.draining.insert(id, record.clone());
        Some(record)
    }

    pub(super) fn ids_where(&self, pred: impl Fn(&WorkerRecord) -> bool) -> Vec<WorkerId> {
        self.lock()
            .active
            .values()
            .filter(|e| pred(&e.record))
            .map(|e| e.record.id)
            .collect()
    }

    pub(super) fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    fn lock(&self) -> MutexGuard<'_, Workers> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured workers per generation.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Standard escalation delays.
    pub fn termination(&self) -> TerminationPolicy {
        self.inner.termination
    }

    /// Workers eligible for auto-replacement, ordered by id.
    pub fn active(&self) -> Vec<WorkerRecord> {
        self.lock()
            .active
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn active_ids(&self) -> Vec<WorkerId> {
        self.ids_where(|_| true)
    }

    /// Workers handed to termination that have not exited yet.
    pub fn draining(&self) -> Vec<WorkerRecord> {
        self.lock().draining.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().active.is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerRecord> {
        let workers = self.lock();
        workers
            .active
            .get(&id)
            .map(|e| e.record.clone())
            .or_else(|| workers.draining.get(&id).cloned())
    }

    /// Current state of any worker this pool ever launched.
    pub fn state(&self, id: WorkerId) -> WorkerState {
        self.get(id)
            .map(|r| r.state)
            .unwrap_or(WorkerState::Terminated)
    }

    /// Active workers that reported listening.
    pub fn listening_count(&self) -> usize {
        self.lock()
            .active
            .values()
            .filter(|e| e.record.state == WorkerState::Listening)
            .count()
    }

    /// Newest generation that reached the listening state (0 before the first).
    pub fn current_generation(&self) -> u64 {
        self.inner.current_generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::policy::{Policy, StaticPolicy};
    use crate::core::router;
    use crate::process::fake::{FakeLauncher, WorkerBehavior};

    pub(crate) fn test_config(pool_size: usize) -> Config {
        let mut cfg = Config::default();
        cfg.pool_size = pool_size;
        cfg.worker = CommandSpec::new("worker");
        cfg.termination = TerminationPolicy {
            graceful: Duration::from_millis(200),
            forceful: Duration::from_millis(400),
        };
        cfg.grace = Duration::from_secs(2);
        cfg
    }

    pub(crate) fn test_pool(cfg: &Config, launcher: &FakeLauncher) -> (WorkerPool, Bus) {
        let bus = Bus::new(1024);
        let (control, _rx) = router::channel();
        let policy = Arc::new(Policy::new(StaticPolicy::default(), bus.clone()));
        let pool = WorkerPool::new(
            cfg,
            Arc::new(launcher.clone()),
            bus.clone(),
            control,
            policy,
            CancellationToken::new(),
        );
        (pool, bus)
    }

    pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_spawn_pool_waits_for_every_worker() {
        let launcher = FakeLauncher::new();
        let cfg = test_config(3);
        let (pool, _bus) = test_pool(&cfg, &launcher);

        let generation = pool.spawn_pool(3).await.unwrap();

        assert_eq!(generation.number, 1);
        assert_eq!(generation.workers.len(), 3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.listening_count(), 3);
        assert_eq!(pool.current_generation(), 1);

        let env = &launcher.workers()[0].env;
        assert_eq!(env.get(ENV_GENERATION).map(String::as_str), Some("1"));
        assert!(env.contains_key(ENV_WORKER_ID));
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced_others_untouched() {
        let launcher = FakeLauncher::new();
        let cfg = test_config(3);
        let (pool, bus) = test_pool(&cfg, &launcher);
        let mut events = bus.subscribe();

        let generation = pool.spawn_pool(3).await.unwrap();
        let victim = generation.workers[1];
        let survivors: Vec<_> = generation
            .workers
            .iter()
            .copied()
            .filter(|id| *id != victim)
            .collect();

        launcher.crash(victim);
        wait_until(|| {
            let ids = pool.active_ids();
            ids.len() == 3 && !ids.contains(&victim)
        })
        .await;

        for id in survivors {
            let record = pool.get(id).unwrap();
            assert_eq!(record.generation, 1);
            assert_eq!(record.state, WorkerState::Listening);
        }
        assert!(pool.active().iter().all(|r| r.generation == 1));
        assert_eq!(pool.state(victim), WorkerState::Terminated);

        let mut crashed = false;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::WorkerCrashed {
                assert_eq!(ev.worker, Some(victim));
                crashed = true;
            }
        }
        assert!(crashed);
    }

    #[tokio::test]
    async fn test_crash_before_listening_is_replaced_within_generation() {
        let launcher = FakeLauncher::new();
        launcher.set_worker_behavior(WorkerBehavior {
            listen_delay: Duration::from_millis(200),
            ..WorkerBehavior::default()
        });
        let cfg = test_config(2);
        let (pool, _bus) = test_pool(&cfg, &launcher);

        let spawning = tokio::spawn({
            let pool = pool.clone();
            async move { pool.spawn_pool(2).await }
        });

        wait_until(|| launcher.workers().len() == 2).await;
        let first = launcher.workers()[0].worker_id().unwrap();
        launcher.crash(first);

        let generation = spawning.await.unwrap().unwrap();
        assert_eq!(generation.workers.len(), 2);
        assert!(!generation.workers.contains(&first));
        assert_eq!(launcher.workers().len(), 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_generation() {
        let launcher = FakeLauncher::new();
        launcher.fail_spawn(true);
        let cfg = test_config(2);
        let (pool, _bus) = test_pool(&cfg, &launcher);

        let err = pool.spawn_pool(2).await.unwrap_err();
        assert_eq!(err.as_label(), "runtime_spawn_failed");
        assert!(pool.is_empty());
    }
}
