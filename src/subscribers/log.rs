//! # LogWriter: structured event logging.
//!
//! Renders incoming [`Event`]s through `tracing`, one line per event, with the event
//! metadata as structured fields.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO poolvisor: worker listening worker=w3 generation=1
//! INFO poolvisor: restart requested origin=action a1 (update)
//! WARN poolvisor: worker crashed, spawning replacement worker=w2 generation=1
//! INFO poolvisor: generation listening generation=2 count=4
//! WARN poolvisor: action failed action=update code=1
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let worker = e.worker.map(|w| w.to_string());
        let worker = worker.as_deref().unwrap_or("-");
        let action = e.action.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("-");

        match e.kind {
            EventKind::WorkerSpawned => {
                debug!(worker, generation = e.generation, pid = e.pid, "worker spawned");
            }
            EventKind::WorkerListening => {
                info!(worker, generation = e.generation, "worker listening");
            }
            EventKind::WorkerExited => {
                debug!(worker, generation = e.generation, code = e.code, "worker exited");
            }
            EventKind::WorkerCrashed => {
                warn!(worker, generation = e.generation, "worker crashed, spawning replacement");
            }
            EventKind::WorkerSpawnFailed => {
                error!(generation = e.generation, reason, "worker spawn failed");
            }
            EventKind::WorkerTerminating => {
                info!(worker, generation = e.generation, "worker terminating");
            }
            EventKind::WorkerForceExit => {
                warn!(worker, "graceful delay elapsed, forcing exit");
            }
            EventKind::WorkerKilled => {
                warn!(worker, "forceful delay elapsed, killed");
            }
            EventKind::GenerationStarting => {
                info!(generation = e.generation, count = e.count, "generation starting");
            }
            EventKind::GenerationListening => {
                info!(generation = e.generation, count = e.count, "generation listening");
            }
            EventKind::GenerationDraining => {
                info!(generation = e.generation, count = e.count, "previous workers draining");
            }
            EventKind::RestartRequested => {
                info!(origin = e.origin.as_deref(), "restart requested");
            }
            EventKind::RestartCompleted => {
                info!(generation = e.generation, "restart completed");
            }
            EventKind::RestartFailed => {
                error!(reason, "restart failed");
            }
            EventKind::PolicyReloaded => {
                debug!(epoch = e.count, "dispatch policy reloaded");
            }
            EventKind::PolicyReloadFailed => {
                warn!(reason, "dispatch policy reload failed, keeping previous");
            }
            EventKind::ActionStarted => {
                debug!(action, pid = e.pid, origin = e.origin.as_deref(), "action started");
            }
            EventKind::ActionCompleted => {
                info!(action, "action completed");
            }
            EventKind::ActionFailed => {
                warn!(action, code = e.code, reason, "action failed");
            }
            EventKind::ActionUnknown => {
                debug!(action, origin = e.origin.as_deref(), "unknown action");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!("all workers stopped within grace");
            }
            EventKind::GraceExceeded => {
                error!(stuck = e.count, "shutdown grace exceeded");
            }
            EventKind::SubscriberOverflow => {
                warn!(subscriber = e.origin.as_deref(), reason, "subscriber dropped event");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = e.origin.as_deref(), reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }

    fn queue_capacity(&self) -> usize {
        4096
    }
}
