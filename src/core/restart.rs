//! # Rolling restart.
//!
//! ```text
//! reload()  policy.reload()                      (failure keeps the old table)
//! swap()    spawn_pool(size)  ── wait: every new worker listening
//!           retire_older_than(new)  ── terminate_worker(old) × k, non-blocking
//! ```
//!
//! No old worker is asked to terminate before the whole new generation listens, so serving
//! capacity never drops below the pool size. If the new generation cannot be assembled the
//! old one keeps serving.
//!
//! `retire_older_than` also catches workers that joined an older generation during the swap
//! (replacements for old workers that crashed meanwhile).

use std::sync::Arc;

use crate::core::{
    policy::Policy,
    pool::{Generation, WorkerPool},
};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};

/// Generation swap of the worker pool.
#[derive(Clone)]
pub struct RestartProtocol {
    pool: WorkerPool,
    policy: Arc<Policy>,
    bus: Bus,
}

impl RestartProtocol {
    pub(crate) fn new(pool: WorkerPool, policy: Arc<Policy>, bus: Bus) -> Self {
        Self { pool, policy, bus }
    }

    /// Reloads the dispatch policy; a failure is published and otherwise ignored.
    pub async fn reload(&self) {
        let _ = self.policy.reload().await;
    }

    /// Spawns a full new generation, then hands every older worker to termination.
    pub async fn swap(&self) -> Result<Generation, RuntimeError> {
        match self.pool.spawn_pool(self.pool.size()).await {
            Ok(generation) => {
                let retired = self.pool.retire_older_than(generation.number);
                self.bus.publish(
                    Event::new(EventKind::GenerationDraining)
                        .with_generation(generation.number)
                        .with_count(retired.len()),
                );
                self.bus.publish(
                    Event::new(EventKind::RestartCompleted).with_generation(generation.number),
                );
                Ok(generation)
            }
            Err(err) => {
                self.bus.publish(
                    Event::new(EventKind::RestartFailed)
                        .with_reason(format!("{}: {err}", err.as_label())),
                );
                Err(err)
            }
        }
    }

    /// `reload` followed by `swap`.
    pub async fn run(&self) -> Result<Generation, RuntimeError> {
        self.reload().await;
        self.swap().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::core::policy::{DispatchTable, StaticPolicy};
    use crate::core::pool::tests::{test_config, wait_until};
    use crate::core::router;
    use crate::process::CommandSpec;
    use crate::process::fake::{FakeLauncher, WorkerBehavior};
    use tokio_util::sync::CancellationToken;

    fn protocol(launcher: &FakeLauncher, table: DispatchTable) -> (RestartProtocol, WorkerPool, Bus) {
        let cfg = test_config(3);
        let bus = Bus::new(4096);
        let (control, _rx) = router::channel();
        let policy = Arc::new(Policy::new(StaticPolicy(table), bus.clone()));
        let pool = WorkerPool::new(
            &cfg,
            Arc::new(launcher.clone()),
            bus.clone(),
            control,
            policy.clone(),
            CancellationToken::new(),
        );
        (RestartProtocol::new(pool.clone(), policy, bus.clone()), pool, bus)
    }

    #[tokio::test]
    async fn test_capacity_never_drops_during_restart() {
        let launcher = FakeLauncher::new();
        let (restart, pool, bus) = protocol(&launcher, DispatchTable::new());
        let mut events = bus.subscribe();

        let old = pool.spawn_pool(3).await.unwrap();
        launcher.set_worker_behavior(WorkerBehavior {
            listen_delay: Duration::from_millis(50),
            ..WorkerBehavior::default()
        });

        let new = restart.run().await.unwrap();
        assert!(new.number > old.number);
        wait_until(|| pool.draining().is_empty()).await;

        let old_ids: HashSet<_> = old.workers.iter().copied().collect();
        assert!(pool.active().iter().all(|r| r.generation == new.number));
        assert!(pool.active_ids().iter().all(|id| !old_ids.contains(id)));
        assert_eq!(pool.len(), 3);

        // Replay the event log: listening workers never drop below the pool size once the
        // first generation is up.
        let mut listening = HashSet::new();
        let mut floor_armed = false;
        while let Ok(ev) = events.try_recv() {
            match ev.kind {
                EventKind::WorkerListening => {
                    listening.insert(ev.worker);
                }
                EventKind::WorkerTerminating => {
                    listening.remove(&ev.worker);
                }
                EventKind::GenerationListening => floor_armed = true,
                _ => {}
            }
            if floor_armed {
                assert!(listening.len() >= 3, "capacity dropped at {:?}", ev.kind);
            }
        }
    }

    #[tokio::test]
    async fn test_new_generation_uses_reloaded_worker_command() {
        let launcher = FakeLauncher::new();
        let table = DispatchTable::new().with_worker(CommandSpec::new("server-v2"));
        let (restart, pool, _bus) = protocol(&launcher, table);

        pool.spawn_pool(3).await.unwrap();
        restart.run().await.unwrap();

        let programs: Vec<_> = launcher
            .workers()
            .iter()
            .map(|c| c.command.program.to_string_lossy().into_owned())
            .collect();
        assert_eq!(programs.len(), 6);
        assert!(programs[..3].iter().all(|p| p == "worker"));
        assert!(programs[3..].iter().all(|p| p == "server-v2"));
        assert!(pool.active().iter().all(|r| r.generation == 2));
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_old_generation() {
        let launcher = FakeLauncher::new();
        let (restart, pool, _bus) = protocol(&launcher, DispatchTable::new());

        let old = pool.spawn_pool(3).await.unwrap();
        launcher.fail_spawn(true);

        let err = restart.run().await.unwrap_err();
        assert_eq!(err.as_label(), "runtime_spawn_failed");
        assert_eq!(pool.active_ids(), old.workers);
        assert_eq!(pool.current_generation(), old.number);
    }

    #[tokio::test]
    async fn test_overlapping_restarts_newest_generation_wins() {
        let launcher = FakeLauncher::new();
        let (restart, pool, _bus) = protocol(&launcher, DispatchTable::new());
        pool.spawn_pool(3).await.unwrap();

        launcher.set_worker_behavior(WorkerBehavior {
            listen_delay: Duration::from_millis(300),
            ..WorkerBehavior::default()
        });
        let slow = tokio::spawn({
            let restart = restart.clone();
            async move { restart.run().await }
        });
        wait_until(|| launcher.workers().len() == 6).await;

        launcher.set_worker_behavior(WorkerBehavior {
            listen_delay: Duration::from_millis(20),
            ..WorkerBehavior::default()
        });
        let fast = restart.run().await.unwrap();
        assert_eq!(fast.number, 3);

        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err.as_label(), "runtime_generation_lost");

        wait_until(|| pool.draining().is_empty()).await;
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.current_generation(), 3);
        assert!(pool.active().iter().all(|r| r.generation == 3));

        let alive: Vec<_> = launcher
            .workers()
            .into_iter()
            .filter(|c| !c.handle.has_exited())
            .collect();
        assert_eq!(alive.len(), 3);
        assert!(alive.iter().all(|c| fast.workers.contains(&c.worker_id().unwrap())));
    }
}
