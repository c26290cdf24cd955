//! # Child side of the supervisor pipe.
//!
//! Worker and action processes call [`connect`] once at startup. It returns a [`ParentSender`]
//! for frames going up (stdout) and a receiver for frames coming down (stdin).
//!
//! Because stdout carries frames, children must log to stderr.

use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    sync::{Mutex, mpsc},
};
use tracing::warn;

use crate::error::ProcessError;
use crate::message::{ControlMessage, Frame};

use super::os::{decode_line, write_frame};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable writer for frames addressed to the supervisor.
#[derive(Clone)]
pub struct ParentSender {
    out: Arc<Mutex<BoxWriter>>,
}

impl ParentSender {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Writes one frame; frames from concurrent callers never interleave.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<(), ProcessError> {
        let frame = frame.into();
        let mut out = self.out.lock().await;
        write_frame(&mut *out, &frame).await
    }

    /// Reports that this worker is serving.
    pub async fn listening(&self, addr: Option<String>) -> Result<(), ProcessError> {
        self.send(Frame::Listening { addr }).await
    }

    /// Sends a control message to the router.
    pub async fn message(&self, message: ControlMessage) -> Result<(), ProcessError> {
        self.send(message).await
    }
}

/// Connects to the supervisor over this process's stdin/stdout.
pub fn connect() -> (ParentSender, mpsc::UnboundedReceiver<Frame>) {
    connect_with(tokio::io::stdin(), tokio::io::stdout())
}

/// Connects over arbitrary streams.
pub fn connect_with<R, W>(reader: R, writer: W) -> (ParentSender, mpsc::UnboundedReceiver<Frame>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match decode_line(&line) {
                Some(frame) => {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                None => warn!(line, "dropping undecodable frame from supervisor"),
            }
        }
    });
    (ParentSender::new(writer), rx)
}
