//! # Global runtime configuration.
//!
//! Provides [`Config`], the centralized settings for the supervisor runtime. A config is
//! built in code (`Config::default()` plus field assignments) or loaded from a TOML file
//! with [`Config::load`]; missing keys keep their defaults.
//!
//! ```toml
//! pool_size = 4
//! grace_ms = 30000
//! bus_capacity = 1024
//! actions = "actions.toml"
//! record = "data.json"
//! listen = "127.0.0.1:8080"
//!
//! [worker]
//! program = "/usr/local/bin/poolvisor"
//! args = ["worker"]
//!
//! [termination]
//! graceful_ms = 5000
//! forceful_ms = 10000
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::core::termination::TerminationPolicy;
use crate::error::ConfigError;
use crate::process::{CommandSpec, ENV_LISTEN, ENV_RECORD};

/// Global configuration for the supervisor runtime.
///
/// ## Field semantics
/// - `pool_size`: workers per generation (min 1)
/// - `grace`: maximum wait for every worker to exit on shutdown
/// - `termination`: per-worker escalation delays
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `worker`: default worker command, used when the dispatch table sets none
/// - `actions`: dispatch table file, reloaded on every restart
/// - `record`, `listen`: handed to every child through the environment
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool_size: usize,

    /// Shutdown window.
    #[serde(rename = "grace_ms", with = "millis")]
    pub grace: Duration,

    pub termination: TerminationPolicy,

    /// Slow subscribers that lag behind more than `bus_capacity` events skip older items.
    pub bus_capacity: usize,

    pub worker: CommandSpec,

    pub actions: Option<PathBuf>,

    pub record: PathBuf,

    pub listen: String,
}

impl Config {
    /// Loads a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns the pool size clamped to a minimum of 1.
    #[inline]
    pub fn pool_size_clamped(&self) -> usize {
        self.pool_size.max(1)
    }

    /// Environment shared by every child.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                ENV_RECORD.to_string(),
                self.record.to_string_lossy().into_owned(),
            ),
            (ENV_LISTEN.to_string(), self.listen.clone()),
        ])
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `pool_size = 4`
    /// - `grace = 30s`
    /// - `termination = 5s graceful / 10s forceful`
    /// - `bus_capacity = 1024`
    /// - `worker = <current executable> worker`
    /// - `record = data.json`, `listen = 127.0.0.1:8080`
    fn default() -> Self {
        Self {
            pool_size: 4,
            grace: Duration::from_secs(30),
            termination: TerminationPolicy::default(),
            bus_capacity: 1024,
            worker: CommandSpec::new(current_exe()).arg("worker"),
            actions: None,
            record: PathBuf::from("data.json"),
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Path of the running binary, falling back to the bare name on `PATH`.
pub(crate) fn current_exe() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("poolvisor"))
}

/// Durations written as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
