//! # Control side of one child process.
//!
//! [`ProcessHandle`] is a cheap, cloneable handle used by the pool, the termination timers and
//! the dispatcher to talk to a child without owning it. The launcher that created the child
//! owns the driver task; the handle only holds channel senders and the exit token.
//!
//! ## Rules
//! - The exit token is cancelled **before** [`ProcessEvent::Exited`] is delivered.
//! - Every operation is safe after exit: `send`/`signal` return [`ProcessError::Gone`],
//!   `exited()` resolves immediately.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;
use crate::message::Frame;

/// Escalation signals understood by every launcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit now (SIGTERM).
    Terminate,
    /// Unconditional kill (SIGKILL).
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => f.write_str("terminate"),
            Signal::Kill => f.write_str("kill"),
        }
    }
}

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signo: i32) -> Self {
        Self {
            code: None,
            signal: Some(signo),
        }
    }

    /// Status for a child whose event stream ended without reporting an exit.
    pub fn lost() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Status code as seen by a shell: the exit code, `128 + signo` for a
    /// signal-terminated process, `1` when nothing is known.
    pub fn code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signo)) => 128 + signo,
            (None, None) => 1,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.code() == 0
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return Self::from_signal(signo);
            }
        }
        match status.code() {
            Some(code) => Self::from_code(code),
            None => Self::lost(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={code}"),
            (None, Some(signo)) => write!(f, "signal={signo}"),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Something the child did.
#[derive(Debug)]
pub enum ProcessEvent {
    /// A decoded frame from the child.
    Frame(Frame),
    /// The child exited; always the last event.
    Exited(ExitStatus),
}

/// Cloneable control handle for a running child.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    frames: mpsc::UnboundedSender<Frame>,
    signals: mpsc::UnboundedSender<Signal>,
    exited: CancellationToken,
}

impl ProcessHandle {
    /// Creates a handle; used by launchers.
    pub fn new(
        pid: Option<u32>,
        frames: mpsc::UnboundedSender<Frame>,
        signals: mpsc::UnboundedSender<Signal>,
        exited: CancellationToken,
    ) -> Self {
        Self {
            pid,
            frames,
            signals,
            exited,
        }
    }

    /// OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues a frame for the child.
    pub fn send(&self, frame: impl Into<Frame>) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Err(ProcessError::Gone);
        }
        self.frames
            .send(frame.into())
            .map_err(|_| ProcessError::Gone)
    }

    /// Delivers an escalation signal.
    pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Err(ProcessError::Gone);
        }
        self.signals.send(signal).map_err(|_| ProcessError::Gone)
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Completes once the child has exited.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }
}
