//! Session lifecycle and the guarded write path.
//!
//! A `Session` owns the write half of the control connection behind a
//! single async mutex. Responses and heartbeats both go through
//! [`Session::send`], which holds the lock for exactly one full frame, so
//! frames from different tasks never interleave on the wire.
//!
//! ## State machine
//!
//! ```text
//! Connecting -> Active -> Closing -> Closed
//! ```
//!
//! State only moves forward. Entering `Closing` also fires the session's
//! cancellation token, which is how the reader and heartbeat loops learn
//! that they should stop.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::protocol::Response;

/// Lifecycle of one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared state of the single live connection.
pub struct Session {
    peer: String,
    state: AtomicU8,
    writer: Mutex<Option<BoxedWriter>>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in the `Connecting` state around `writer`.
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer: peer.into(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            writer: Mutex::new(Some(Box::new(writer))),
            cancel: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// `Connecting -> Active`. Returns false if the session already moved on.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Token cancelled as soon as the session starts closing.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `Closing` (if not already past it) and wake every loop.
    ///
    /// Returns true for the call that performed the transition.
    pub fn begin_closing(&self, reason: &str) -> bool {
        let previous = self.advance(SessionState::Closing);
        self.cancel.cancel();
        if previous < SessionState::Closing {
            info!(peer = %self.peer, reason, "Session closing");
            true
        } else {
            false
        }
    }

    /// External interrupt, e.g. Ctrl-C.
    pub fn interrupt(&self) {
        self.begin_closing("interrupted");
    }

    /// Write one response frame while holding the write lock.
    ///
    /// A failed write moves the session to `Closing`; the caller only has
    /// to log the returned error. A write stalled on a peer that stopped
    /// reading is abandoned once the session starts closing, so the lock
    /// is always released for `shutdown`.
    pub async fn send(&self, response: &Response) -> Result<(), AgentError> {
        let frame = response.encode();
        let mut guard = self.writer.lock().await;

        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                return Err(AgentError::Write(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "session already closed",
                )))
            }
        };

        let result = tokio::select! {
            biased;
            result = write_frame(writer, &frame) => result,
            _ = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "session closing",
            )),
        };
        drop(guard);

        match result {
            Ok(()) => {
                debug!(frame = response.text(), "Sent");
                Ok(())
            }
            Err(e) => {
                self.begin_closing("write failed");
                Err(AgentError::Write(e))
            }
        }
    }

    /// Release the connection and move to `Closed`.
    ///
    /// Safe to call from any number of tasks; only the first call closes
    /// the writer and returns true.
    pub async fn shutdown(&self) -> bool {
        self.begin_closing("shutdown");

        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return false;
        };

        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Error shutting down write half");
        }
        drop(writer);

        self.advance(SessionState::Closed);
        info!(peer = %self.peer, "Session closed");
        true
    }

    /// Monotonic transition; returns the state before the call.
    fn advance(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.state.fetch_max(to as u8, Ordering::AcqRel))
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
