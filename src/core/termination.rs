//! # Escalating worker termination.
//!
//! ```text
//! terminate_worker(id)
//!   ├─ active → draining (no replacement from now on)
//!   ├─ send Frame::Disconnect            (stop accepting, finish in-flight work)
//!   ├─ after `graceful`: Signal::Terminate  ─┐ each timer completes early
//!   └─ after `forceful`: Signal::Kill       ─┘ when the worker exits
//! ```
//!
//! The two timers are independent: both are measured from the moment termination starts.
//! A timer that fires against an exited worker does nothing.

use std::time::Duration;

use serde::Deserialize;
use tokio::time;
use tracing::warn;

use crate::core::config::millis;
use crate::core::pool::{WorkerId, WorkerPool};
use crate::events::{Bus, Event, EventKind};
use crate::message::Frame;
use crate::process::{ProcessHandle, Signal};

/// Escalation delays applied to one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TerminationPolicy {
    /// Delay before the worker is forced to exit.
    #[serde(rename = "graceful_ms", with = "millis")]
    pub graceful: Duration,
    /// Delay before the unconditional kill.
    #[serde(rename = "forceful_ms", with = "millis")]
    pub forceful: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(5),
            forceful: Duration::from_secs(10),
        }
    }
}

impl WorkerPool {
    /// Starts terminating a worker.
    ///
    /// Returns `false` (and does nothing) when the worker is not active: already terminating,
    /// exited or unknown.
    pub fn terminate_worker(&self, id: WorkerId, policy: TerminationPolicy) -> bool {
        let Some(record) = self.unregister(id) else {
            return false;
        };
        self.bus().publish(
            Event::new(EventKind::WorkerTerminating)
                .with_worker(id)
                .with_generation(record.generation),
        );

        if let Err(err) = record.handle.send(Frame::Disconnect) {
            if !err.is_gone() {
                warn!(worker = %id, error = %err, "failed to request disconnect");
            }
        }

        tokio::spawn(escalate(
            record.handle.clone(),
            policy.graceful,
            Signal::Terminate,
            EventKind::WorkerForceExit,
            id,
            self.bus().clone(),
        ));
        tokio::spawn(escalate(
            record.handle,
            policy.forceful,
            Signal::Kill,
            EventKind::WorkerKilled,
            id,
            self.bus().clone(),
        ));
        true
    }

    /// Terminates every active worker older than `generation` with the standard delays.
    ///
    /// Returns the workers handed to termination.
    pub fn retire_older_than(&self, generation: u64) -> Vec<WorkerId> {
        let policy = self.termination();
        self.ids_where(|r| r.generation < generation)
            .into_iter()
            .filter(|id| self.terminate_worker(*id, policy))
            .collect()
    }

    /// Terminates the active workers of one generation.
    pub(crate) fn retire_generation(&self, generation: u64) -> Vec<WorkerId> {
        let policy = self.termination();
        self.ids_where(|r| r.generation == generation)
            .into_iter()
            .filter(|id| self.terminate_worker(*id, policy))
            .collect()
    }

    /// Terminates every active worker and returns a handle for each worker not yet exited
    /// (active and draining).
    pub fn terminate_all(&self, policy: TerminationPolicy) -> Vec<(WorkerId, ProcessHandle)> {
        for id in self.active_ids() {
            self.terminate_worker(id, policy);
        }
        self.draining()
            .into_iter()
            .map(|r| (r.id, r.handle))
            .collect()
    }
}

async fn escalate(
    handle: ProcessHandle,
    delay: Duration,
    signal: Signal,
    kind: EventKind,
    id: WorkerId,
    bus: Bus,
) {
    tokio::select! {
        _ = handle.exited() => {}
        _ = time::sleep(delay) => match handle.signal(signal) {
            Ok(()) => bus.publish(Event::new(kind).with_worker(id)),
            Err(err) if err.is_gone() => {}
            Err(err) => warn!(worker = %id, %signal, error = %err, "escalation failed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::pool::WorkerState;
    use crate::core::pool::tests::{test_config, test_pool, wait_until};
    use crate::process::fake::{FakeLauncher, WorkerBehavior};

    #[tokio::test]
    async fn test_disconnect_is_enough_for_cooperative_worker() {
        let launcher = FakeLauncher::new();
        let cfg = test_config(2);
        let (pool, _bus) = test_pool(&cfg, &launcher);
        let generation = pool.spawn_pool(2).await.unwrap();
        let id = generation.workers[0];

        assert!(pool.terminate_worker(id, cfg.termination));
        assert_eq!(pool.state(id), WorkerState::Terminating);
        assert_eq!(pool.len(), 1);

        wait_until(|| pool.draining().is_empty()).await;
        let child = launcher.worker(id).unwrap();
        assert_eq!(child.frames(), vec![Frame::Disconnect]);

        time::sleep(cfg.termination.forceful * 2).await;
        assert!(child.signals().is_empty());
        assert_eq!(pool.len(), 1);
        assert_eq!(launcher.workers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_to_terminate_then_kill() {
        let launcher = FakeLauncher::new();
        launcher.set_worker_behavior(WorkerBehavior {
            ignore_disconnect: true,
            ignore_terminate: true,
            ..WorkerBehavior::default()
        });
        let cfg = test_config(1);
        let (pool, bus) = test_pool(&cfg, &launcher);
        let mut events = bus.subscribe();
        let generation = pool.spawn_pool(1).await.unwrap();
        let id = generation.workers[0];
        let child = launcher.worker(id).unwrap();

        pool.terminate_worker(id, cfg.termination);

        time::sleep(cfg.termination.graceful + Duration::from_millis(10)).await;
        assert_eq!(child.signals(), vec![Signal::Terminate]);
        assert!(!child.handle.has_exited());

        time::sleep(cfg.termination.forceful).await;
        assert_eq!(child.signals(), vec![Signal::Terminate, Signal::Kill]);
        assert!(child.handle.has_exited());
        assert!(pool.is_empty());

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert!(kinds.contains(&EventKind::WorkerForceExit));
        assert!(kinds.contains(&EventKind::WorkerKilled));
        assert!(!kinds.contains(&EventKind::WorkerCrashed));
    }

    #[tokio::test]
    async fn test_terminating_exited_worker_is_noop() {
        let launcher = FakeLauncher::new();
        let cfg = test_config(1);
        let (pool, _bus) = test_pool(&cfg, &launcher);
        let id = pool.spawn_pool(1).await.unwrap().workers[0];

        assert!(pool.terminate_worker(id, cfg.termination));
        wait_until(|| pool.draining().is_empty()).await;

        assert!(!pool.terminate_worker(id, cfg.termination));
        assert!(!pool.terminate_worker(id, cfg.termination));
        assert!(pool.is_empty());
        assert_eq!(launcher.workers().len(), 1);
    }

    #[tokio::test]
    async fn test_retire_older_than_keeps_newer_generation() {
        let launcher = FakeLauncher::new();
        let cfg = test_config(2);
        let (pool, _bus) = test_pool(&cfg, &launcher);

        let old = pool.spawn_pool(2).await.unwrap();
        let new = pool.spawn_pool(2).await.unwrap();
        let retired = pool.retire_older_than(new.number);

        assert_eq!(retired, old.workers);
        assert_eq!(pool.active_ids(), new.workers);
    }
}
