//! Error types used by the poolvisor runtime, its processes and actions.
//!
//! This module defines the error enums of the crate:
//!
//! - [`RuntimeError`] errors raised by the supervisor runtime itself.
//! - [`ProcessError`] errors raised while launching or talking to a child process.
//! - [`DispatchError`] errors raised when an action cannot be started.
//! - [`PolicyError`] errors raised while loading a dispatch table.
//! - [`RecordError`] errors raised by the record file.
//! - [`ConfigError`] errors raised while loading configuration.
//! - [`ServiceError`] errors raised by the worker service and built-in actions.
//!
//! Every enum provides `as_label` (stable snake_case label for logs/events).

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::core::WorkerId;

/// # Errors produced by the supervisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A generation could not reach the listening state because one of its
    /// workers disappeared before reporting (spawn failure or deliberate termination).
    #[error("generation {generation} lost a worker before it was listening")]
    GenerationLost {
        /// Generation number that failed to assemble.
        generation: u64,
    },

    /// A worker process could not be launched.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] ProcessError),

    /// The initial dispatch table could not be loaded.
    #[error("failed to load dispatch policy: {0}")]
    Policy(#[from] PolicyError),

    /// `start()` was called more than once.
    #[error("supervisor already started")]
    AlreadyStarted,

    /// Shutdown grace period was exceeded; some workers were still alive.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Workers that did not exit in time.
        stuck: Vec<WorkerId>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    ///
    /// # Example
    /// ```
    /// use poolvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GenerationLost { .. } => "runtime_generation_lost",
            RuntimeError::Spawn(_) => "runtime_spawn_failed",
            RuntimeError::Policy(_) => "runtime_policy_failed",
            RuntimeError::AlreadyStarted => "runtime_already_started",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// # Errors produced by child process plumbing.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The OS refused to start the program.
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A standard stream was not captured.
    #[error("child {0} pipe was not captured")]
    Pipe(&'static str),

    /// The process has already exited (or its channel is closed).
    #[error("process is gone")]
    Gone,

    /// Delivering a signal failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Writing a frame to the process failed.
    #[error("ipc error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Spawn { .. } => "process_spawn_failed",
            ProcessError::Pipe(_) => "process_pipe_missing",
            ProcessError::Gone => "process_gone",
            ProcessError::Signal { .. } => "process_signal_failed",
            ProcessError::Io(_) => "process_io",
            ProcessError::Encode(_) => "process_encode",
        }
    }

    /// True when the error only means the process is no longer there.
    pub fn is_gone(&self) -> bool {
        matches!(self, ProcessError::Gone)
    }
}

/// # Errors produced when dispatching an action.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No logic is registered under the requested action name.
    #[error("unknown action {name:?}")]
    UnknownAction { name: String },

    /// The action is registered but its process could not be started.
    #[error("failed to start action {name:?}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: ProcessError,
    },
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    ///
    /// # Example
    /// ```
    /// use poolvisor::DispatchError;
    ///
    /// let err = DispatchError::UnknownAction { name: "deploy".into() };
    /// assert_eq!(err.as_label(), "action_unknown");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::UnknownAction { .. } => "action_unknown",
            DispatchError::Spawn { .. } => "action_spawn_failed",
        }
    }
}

/// # Errors produced while loading a dispatch table.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl PolicyError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            PolicyError::Read { .. } => "policy_read_failed",
            PolicyError::Parse { .. } => "policy_parse_failed",
        }
    }
}

/// # Errors produced by the record file.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("failed to read record {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record {path:?} is not valid json: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write record {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecordError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            RecordError::Read { .. } => "record_read_failed",
            RecordError::Parse { .. } => "record_parse_failed",
            RecordError::Encode { .. } => "record_encode_failed",
            RecordError::Write { .. } => "record_write_failed",
        }
    }
}

/// # Errors produced while loading configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read_failed",
            ConfigError::Parse { .. } => "config_parse_failed",
        }
    }
}

/// # Errors produced by the worker service and the built-in actions.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A required parameter or environment variable is missing or malformed.
    #[error("invalid parameter {name}: {reason}")]
    Param { name: String, reason: String },

    /// The listen socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// The pipe to the supervisor failed.
    #[error(transparent)]
    Link(#[from] ProcessError),
}

impl ServiceError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::Param { .. } => "service_param_invalid",
            ServiceError::Bind { .. } => "service_bind_failed",
            ServiceError::Serve(_) => "service_serve_failed",
            ServiceError::Record(_) => "service_record_failed",
            ServiceError::Link(_) => "service_link_failed",
        }
    }
}
