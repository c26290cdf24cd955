//! # Dispatch policy: which program runs for which action.
//!
//! A [`DispatchTable`] is an immutable map from action name to [`ActionSpec`], plus an
//! optional worker command for new generations. [`Policy`] holds the current table in an
//! [`ArcSwap`]; [`Policy::reload`] loads a fresh table from its [`PolicySource`] and swaps it in
//! atomically.
//!
//! ## Rules
//! - Readers take an `Arc` snapshot ([`Policy::current`]); a reload never changes a snapshot
//!   already taken, so in-flight dispatches are unaffected.
//! - A failed reload keeps the previous table and publishes `PolicyReloadFailed`.
//!
//! ## File format
//! ```toml
//! [worker]
//! program = "/usr/local/bin/poolvisor"
//! args = ["worker"]
//!
//! [actions.update]
//! program = "/usr/local/bin/poolvisor"
//! args = ["action", "update"]
//!
//! [actions.backup]
//! program = "/opt/tools/backup.sh"
//! env = { TARGET = "s3" }
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{DispatchError, PolicyError};
use crate::events::{Bus, Event, EventKind};
use crate::process::CommandSpec;

/// Program registered for one action name.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ActionSpec {
    #[serde(flatten)]
    pub command: CommandSpec,
    /// Extra environment for the action process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ActionSpec {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Immutable action registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchTable {
    /// Worker command for new generations.
    pub worker: Option<CommandSpec>,
    pub actions: BTreeMap<String, ActionSpec>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in actions served by `program` (`<program> action <name>`).
    pub fn builtin(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self::new().with_action(
            "update",
            ActionSpec::new(CommandSpec::new(program).arg("action").arg("update")),
        )
    }

    #[must_use]
    pub fn with_action(mut self, name: impl Into<String>, spec: ActionSpec) -> Self {
        self.actions.insert(name.into(), spec);
        self
    }

    #[must_use]
    pub fn with_worker(mut self, command: CommandSpec) -> Self {
        self.worker = Some(command);
        self
    }

    /// Looks up an action; unregistered names fail with [`DispatchError::UnknownAction`].
    pub fn lookup(&self, name: &str) -> Result<&ActionSpec, DispatchError> {
        self.actions
            .get(name)
            .ok_or_else(|| DispatchError::UnknownAction {
                name: name.to_string(),
            })
    }

    /// Overlays `other` on top of `self`: its actions replace same-named ones, its worker
    /// command (if any) replaces ours.
    #[must_use]
    pub fn merged(mut self, other: DispatchTable) -> Self {
        self.actions.extend(other.actions);
        if other.worker.is_some() {
            self.worker = other.worker;
        }
        self
    }
}

/// Where dispatch tables come from.
#[async_trait]
pub trait PolicySource: Send + Sync + 'static {
    async fn load(&self) -> Result<DispatchTable, PolicyError>;
}

/// A fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticPolicy(pub DispatchTable);

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn load(&self) -> Result<DispatchTable, PolicyError> {
        Ok(self.0.clone())
    }
}

/// A TOML file read on every load, layered over a base table.
#[derive(Clone, Debug)]
pub struct FilePolicy {
    path: PathBuf,
    base: DispatchTable,
}

impl FilePolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base: DispatchTable::default(),
        }
    }

    #[must_use]
    pub fn with_base(mut self, base: DispatchTable) -> Self {
        self.base = base;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicySource for FilePolicy {
    async fn load(&self) -> Result<DispatchTable, PolicyError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PolicyError::Read {
                path: self.path.clone(),
                source,
            })?;
        let table: DispatchTable = toml::from_str(&text).map_err(|source| PolicyError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.base.clone().merged(table))
    }
}

/// Current dispatch table with atomic reload.
pub struct Policy {
    source: Box<dyn PolicySource>,
    table: ArcSwap<DispatchTable>,
    epoch: AtomicU64,
    bus: Bus,
}

impl Policy {
    /// Creates a policy holding an empty table (epoch 0); call [`Policy::reload`] to load.
    pub fn new(source: impl PolicySource, bus: Bus) -> Self {
        Self::boxed(Box::new(source), bus)
    }

    pub(crate) fn boxed(source: Box<dyn PolicySource>, bus: Bus) -> Self {
        Self {
            source,
            table: ArcSwap::from_pointee(DispatchTable::default()),
            epoch: AtomicU64::new(0),
            bus,
        }
    }

    /// Snapshot of the current table.
    #[inline]
    pub fn current(&self) -> Arc<DispatchTable> {
        self.table.load_full()
    }

    /// Number of successful loads so far.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Loads a fresh table and swaps it in; returns the new epoch.
    pub async fn reload(&self) -> Result<u64, PolicyError> {
        match self.source.load().await {
            Ok(table) => {
                self.table.store(Arc::new(table));
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.bus
                    .publish(Event::new(EventKind::PolicyReloaded).with_count(epoch));
                Ok(epoch)
            }
            Err(err) => {
                self.bus.publish(
                    Event::new(EventKind::PolicyReloadFailed)
                        .with_reason(format!("{}: {err}", err.as_label())),
                );
                Err(err)
            }
        }
    }
}
