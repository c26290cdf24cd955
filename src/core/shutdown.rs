//! # Supervisor-side OS signals.
//!
//! [`ShutdownSignals::recv`] resolves with the first of `SIGINT`, `SIGTERM` or `SIGQUIT`
//! delivered to the supervisor. Workers never see these signals directly: they are drained
//! through [`WorkerPool::terminate_all`](super::WorkerPool::terminate_all).

use std::fmt;

use tokio::signal::unix::{Signal, SignalKind, signal};

/// Signal that ended a [`Supervisor::run`](super::Supervisor::run).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl ShutdownSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listeners for the supervisor's termination signals.
///
/// Signals raised after [`register`](Self::register) returns are never missed, even before
/// [`recv`](Self::recv) is first polled.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.quit.recv()      => ShutdownSignal::Quit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sigterm_to_self_is_reported() {
        let mut signals = ShutdownSignals::register().unwrap();
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
        let got = tokio::time::timeout(std::time::Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(got, ShutdownSignal::Terminate);
        assert_eq!(got.to_string(), "SIGTERM");
    }
}
