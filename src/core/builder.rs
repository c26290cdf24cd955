use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        Config,
        config::current_exe,
        dispatcher::ActionDispatcher,
        policy::{DispatchTable, FilePolicy, Policy, PolicySource, StaticPolicy},
        pool::WorkerPool,
        restart::RestartProtocol,
        router::{self, Router},
    },
    events::Bus,
    process::{Launch, OsLauncher},
    subscribers::{Subscribe, SubscriberSet},
};

use super::supervisor::Supervisor;

/// Builder for constructing a Supervisor with optional collaborators.
pub struct SupervisorBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    launcher: Option<Arc<dyn Launch>>,
    policy: Option<Box<dyn PolicySource>>,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            launcher: None,
            policy: None,
        }
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive runtime events (worker lifecycle, restarts, actions)
    /// through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Replaces the process launcher (default: [`OsLauncher`]).
    pub fn with_launcher(mut self, launcher: Arc<dyn Launch>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Replaces the dispatch policy source.
    ///
    /// Default: the built-in actions of the running binary, overlaid with the
    /// [`Config::actions`] file when one is configured.
    pub fn with_policy(mut self, source: impl PolicySource) -> Self {
        self.policy = Some(Box::new(source));
        self
    }

    /// Builds and returns the Supervisor instance.
    ///
    /// This consumes the builder and initializes all runtime components:
    /// - Event bus for broadcasting
    /// - Subscriber workers
    /// - Dispatch policy, worker pool, action dispatcher and router
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Arc<Supervisor> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let runtime_token = CancellationToken::new();

        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(OsLauncher::new()));
        let source = self
            .policy
            .unwrap_or_else(|| default_policy(&self.cfg));
        let policy = Arc::new(Policy::boxed(source, bus.clone()));

        let (control, rx) = router::channel();
        let pool = WorkerPool::new(
            &self.cfg,
            Arc::clone(&launcher),
            bus.clone(),
            control.clone(),
            Arc::clone(&policy),
            runtime_token.clone(),
        );
        let dispatcher = ActionDispatcher::new(
            &self.cfg,
            launcher,
            Arc::clone(&policy),
            control.clone(),
            bus.clone(),
        );
        let restart = RestartProtocol::new(pool.clone(), Arc::clone(&policy), bus.clone());
        let router = Router::new(dispatcher, restart, bus.clone());

        Arc::new(Supervisor::new_internal(
            self.cfg,
            bus,
            subs,
            policy,
            pool,
            control,
            (router, rx),
            runtime_token,
        ))
    }
}

fn default_policy(cfg: &Config) -> Box<dyn PolicySource> {
    let builtin = DispatchTable::builtin(current_exe());
    match &cfg.actions {
        Some(path) => Box::new(FilePolicy::new(path).with_base(builtin)),
        None => Box::new(StaticPolicy(builtin)),
    }
}
