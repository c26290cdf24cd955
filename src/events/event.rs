//! # Runtime events emitted by the supervisor, pool, router and dispatcher.
//!
//! The [`EventKind`] enum classifies event types across five groups:
//! - **Worker events**: one worker process (spawned, listening, exited, escalation)
//! - **Generation events**: a cohort of workers spawned together
//! - **Control events**: restart requests, policy reloads, action lifecycle
//! - **Shutdown events**: supervisor shutdown outcome
//! - **Subscriber events**: overflow/panic of event subscribers
//!
//! The [`Event`] struct carries the metadata (worker id, generation, pid, action name,
//! status code, counts and a free-form reason).
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use poolvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::ActionFailed)
//!     .with_action("update")
//!     .with_code(3);
//!
//! assert_eq!(ev.kind, EventKind::ActionFailed);
//! assert_eq!(ev.action.as_deref(), Some("update"));
//! assert_eq!(ev.code, Some(3));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::core::WorkerId;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets `origin` (subscriber name) and `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets `origin` (subscriber name) and `reason` ("full" or "closed").
    SubscriberOverflow,

    // === Worker events ===
    /// A worker process was launched and registered as auto-replaceable.
    ///
    /// Sets `worker`, `generation`, `pid`.
    WorkerSpawned,

    /// A registered worker reported that it is serving.
    ///
    /// Sets `worker`, `generation`.
    WorkerListening,

    /// A worker process exited (crash or after termination).
    ///
    /// Sets `worker`, `generation`, `code`.
    WorkerExited,

    /// A registered worker exited without being terminated; a replacement follows.
    ///
    /// Sets `worker`, `generation`.
    WorkerCrashed,

    /// Launching a worker failed.
    ///
    /// Sets `generation`, `reason`.
    WorkerSpawnFailed,

    /// Termination started: the worker was unregistered and told to disconnect.
    ///
    /// Sets `worker`, `generation`.
    WorkerTerminating,

    /// The graceful delay elapsed and the worker was forced to exit (SIGTERM).
    ///
    /// Sets `worker`.
    WorkerForceExit,

    /// The forceful delay elapsed and the worker was killed (SIGKILL).
    ///
    /// Sets `worker`.
    WorkerKilled,

    // === Generation events ===
    /// A new generation is being spawned.
    ///
    /// Sets `generation`, `count` (pool size).
    GenerationStarting,

    /// Every worker of the generation is listening.
    ///
    /// Sets `generation`, `count`.
    GenerationListening,

    /// Older workers were handed to termination after a generation came up.
    ///
    /// Sets `generation` (the new one), `count` (workers retired).
    GenerationDraining,

    // === Control events ===
    /// A `restart` control message was received.
    ///
    /// Sets `origin`.
    RestartRequested,

    /// The restart protocol finished its drain step.
    ///
    /// Sets `generation`.
    RestartCompleted,

    /// The restart protocol could not assemble a new generation.
    ///
    /// Sets `reason`.
    RestartFailed,

    /// The dispatch table was reloaded.
    ///
    /// Sets `count` (reload epoch).
    PolicyReloaded,

    /// Reloading the dispatch table failed; the previous table stays in force.
    ///
    /// Sets `reason`.
    PolicyReloadFailed,

    /// An action process was started.
    ///
    /// Sets `action`, `pid`, `origin`.
    ActionStarted,

    /// An action process exited with status 0.
    ///
    /// Sets `action`.
    ActionCompleted,

    /// An action process exited nonzero (or could not be started).
    ///
    /// Sets `action`, `code`, optional `reason`.
    ActionFailed,

    /// No logic is registered for the requested action; no reply is sent.
    ///
    /// Sets `action`, `origin`.
    ActionUnknown,

    // === Shutdown events ===
    /// Shutdown requested (OS signal observed or explicit call).
    ShutdownRequested,

    /// All workers exited within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some workers did not exit in time.
    ///
    /// Sets `count` (workers still alive).
    GraceExceeded,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Worker the event is about.
    pub worker: Option<WorkerId>,
    /// Generation number.
    pub generation: Option<u64>,
    /// OS process id.
    pub pid: Option<u32>,
    /// Action name.
    pub action: Option<Arc<str>>,
    /// Exit/status code.
    pub code: Option<i32>,
    /// Size or counter (pool size, retired workers, reload epoch).
    pub count: Option<u64>,
    /// Who caused the event (requester, subscriber name).
    pub origin: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker: None,
            generation: None,
            pid: None,
            action: None,
            code: None,
            count: None,
            origin: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_worker(mut self, id: WorkerId) -> Self {
        self.worker = Some(id);
        self
    }

    #[inline]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    #[inline]
    pub fn with_action(mut self, name: impl Into<Arc<str>>) -> Self {
        self.action = Some(name.into());
        self
    }

    #[inline]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    #[inline]
    pub fn with_count(mut self, count: impl TryInto<u64>) -> Self {
        self.count = count.try_into().ok();
        self
    }

    #[inline]
    pub fn with_origin(mut self, origin: impl Into<Arc<str>>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_origin(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_origin(subscriber)
            .with_reason(info)
    }
}
