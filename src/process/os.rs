//! # OS-backed launcher.
//!
//! [`OsLauncher`] starts children with [`tokio::process`] and speaks newline-delimited JSON
//! [`Frame`]s over their stdin/stdout. Stderr is inherited so child logs reach the terminal.
//!
//! ## Architecture
//! ```text
//! ProcessHandle.send(frame) ──► frames rx ──► write_frames() ──► child stdin
//!
//! child stdout ──► drive() ──► ProcessEvent::Frame ──► events rx (pool / dispatcher)
//! signals rx   ──► drive() ──► kill(2) / Child::start_kill
//! child.wait() ──► drive() ──► drain stdout ──► exited.cancel() ──► ProcessEvent::Exited
//! ```
//!
//! ## Rules
//! - Stdout is drained after exit, so a message written right before exiting is still delivered.
//! - Lines that do not decode as a [`Frame`] are logged and dropped.
//! - `Signal::Terminate` is SIGTERM, `Signal::Kill` is SIGKILL (`Child::start_kill`).

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::message::Frame;

use super::handle::{ExitStatus, ProcessEvent, ProcessHandle, Signal};
use super::launch::{Launch, LaunchSpec, Launched, Role};

/// Upper bound for reading leftover stdout after the child exited.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

/// Launcher for real OS processes.
#[derive(Clone, Debug, Default)]
pub struct OsLauncher {
    env: BTreeMap<String, String>,
}

impl OsLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment applied to every child (before the per-launch environment).
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

impl Launch for OsLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched, ProcessError> {
        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .envs(&self.env)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.command.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(ProcessError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = CancellationToken::new();

        debug!(role = %spec.role, pid, program = ?spec.command.program, "child started");

        tokio::spawn(write_frames(stdin, frame_rx));
        tokio::spawn(drive(
            child,
            pid,
            stdout,
            signal_rx,
            event_tx,
            exited.clone(),
            spec.role,
        ));

        Ok(Launched {
            handle: ProcessHandle::new(pid, frame_tx, signal_tx, exited),
            events: event_rx,
        })
    }
}

/// Owns the child until it exits.
async fn drive(
    mut child: Child,
    pid: Option<u32>,
    stdout: ChildStdout,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exited: CancellationToken,
    role: Role,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => forward(&events, &role, &line),
                Ok(None) => stdout_open = false,
                Err(err) => {
                    warn!(%role, error = %err, "child stdout failed");
                    stdout_open = false;
                }
            },
            Some(signal) = signals.recv() => {
                let delivered = match signal {
                    Signal::Terminate => terminate(pid),
                    Signal::Kill => child.start_kill().map_err(|source| ProcessError::Signal {
                        pid: pid.unwrap_or_default(),
                        source,
                    }),
                };
                if let Err(err) = delivered {
                    debug!(%role, %signal, error = %err, "signal not delivered");
                }
            }
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitStatus::from(status),
                    Err(err) => {
                        warn!(%role, error = %err, "failed to wait for child");
                        ExitStatus::lost()
                    }
                };
            }
        }
    };

    if stdout_open {
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                forward(&events, &role, &line);
            }
        };
        if time::timeout(STDOUT_DRAIN, drain).await.is_err() {
            debug!(%role, "stdout still open after exit; leftover output dropped");
        }
    }

    exited.cancel();
    let _ = events.send(ProcessEvent::Exited(status));
}

fn forward(events: &mpsc::UnboundedSender<ProcessEvent>, role: &Role, line: &str) {
    if let Some(frame) = decode_line(line) {
        let _ = events.send(ProcessEvent::Frame(frame));
    } else {
        warn!(%role, line, "dropping undecodable frame");
    }
}

/// Decodes one pipe line; blank or malformed lines yield `None`.
pub(crate) fn decode_line(line: &str) -> Option<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Encodes one frame as a JSON line and flushes it.
pub(crate) async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), ProcessError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await?;
    Ok(())
}

async fn write_frames(mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut stdin, &frame).await {
            debug!(error = %err, "child stdin closed");
            break;
        }
    }
}

/// Sends SIGTERM; SIGKILL goes through [`Child::start_kill`].
#[cfg(unix)]
fn terminate(pid: Option<u32>) -> Result<(), ProcessError> {
    let pid = pid.ok_or(ProcessError::Gone)?;
    let raw = libc::pid_t::try_from(pid).map_err(|_| ProcessError::Gone)?;
    // SAFETY: kill(2) takes plain integers; the pid is our own child and is not reaped
    // until `drive` observes `child.wait()`.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ProcessError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn terminate(pid: Option<u32>) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        pid: pid.unwrap_or_default(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "SIGTERM needs unix"),
    })
}
