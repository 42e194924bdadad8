//! One interactive terminal session.

use crate::outbox::Outbox;
use crate::protocol::Envelope;
use crate::pty::{self, PtyError, PtyMaster};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes read from the terminal per `pty_output` envelope at most.
const READ_CHUNK: usize = 4096;

/// Input writes queued per session before further input is refused.
const INPUT_QUEUE: usize = 64;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned but not yet announced.
    Created,
    /// Announced with `pty_started`; accepts input and resizes.
    Running,
    /// Termination requested; waiting for the shell to go away.
    Closing,
    /// Gone. The terminal handle has been released.
    Closed,
}

impl SessionState {
    const fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

struct Inner {
    state: SessionState,
    /// (rows, cols)
    size: (u16, u16),
    master: Option<Arc<PtyMaster>>,
    /// Taken by the writer task.
    pending_input: Option<mpsc::Receiver<Vec<u8>>>,
}

/// A shell running on its own pseudo-terminal.
///
/// Lifecycle and handle access are guarded by a per-session lock, which is
/// never held across terminal I/O. Input is queued and written by the
/// session's own writer task. The reader, writer and waiter tasks share the
/// session's cancellation token; closing the session cancels all of them.
pub struct TerminalSession {
    id: String,
    pid: u32,
    inner: Mutex<Inner>,
    input: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl TerminalSession {
    /// Allocate a PTY and spawn `shell` on it.
    ///
    /// `size` is (rows, cols).
    pub fn spawn(
        id: String,
        shell: &str,
        size: Option<(u16, u16)>,
    ) -> Result<(Arc<Self>, Child), PtyError> {
        let (master, child) = pty::spawn(shell, size)?;
        let pid = child.id().unwrap_or_default();
        let (input, pending_input) = mpsc::channel(INPUT_QUEUE);
        let session = Self {
            id,
            pid,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                size: size.unwrap_or((pty::DEFAULT_ROWS, pty::DEFAULT_COLS)),
                master: Some(Arc::new(master)),
                pending_input: Some(pending_input),
            }),
            input,
            cancel: CancellationToken::new(),
        };
        Ok((Arc::new(session), child))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process ID of the shell.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Last applied size as (rows, cols).
    pub async fn size(&self) -> (u16, u16) {
        self.inner.lock().await.size
    }

    /// Token cancelled when the session starts closing.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(super) async fn mark_running(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Created {
            inner.state = SessionState::Running;
        }
    }

    /// Queue keystrokes for the terminal without waiting for them to be
    /// written. Returns false if the session is no longer accepting input.
    pub async fn write_input(&self, data: &[u8]) -> Result<bool, PtyError> {
        if !self.inner.lock().await.state.is_open() {
            return Ok(false);
        }
        match self.input.try_send(data.to_vec()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Err(PtyError::InputBacklog),
            Err(TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Apply new dimensions. Returns false if the session is closing.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<bool, PtyError> {
        let mut inner = self.inner.lock().await;
        let Some(master) = inner.master.as_ref().filter(|_| inner.state.is_open()) else {
            return Ok(false);
        };
        master.resize(rows, cols)?;
        inner.size = (rows, cols);
        Ok(true)
    }

    /// Ask for the session to end. Returns false if it was already ending.
    pub async fn terminate(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_open() {
            return false;
        }
        inner.state = SessionState::Closing;
        self.cancel.cancel();
        true
    }

    /// Mark the session closed and release the terminal handle. Only the
    /// first call returns true.
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return false;
        }
        inner.state = SessionState::Closed;
        inner.master = None;
        self.cancel.cancel();
        true
    }

    async fn master(&self) -> Option<Arc<PtyMaster>> {
        self.inner.lock().await.master.clone()
    }
}

/// Write queued input to the terminal until cancellation or a write error.
pub(super) async fn forward_input(session: Arc<TerminalSession>) {
    let (master, mut pending) = {
        let mut inner = session.inner.lock().await;
        match (inner.master.clone(), inner.pending_input.take()) {
            (Some(master), Some(pending)) => (master, pending),
            _ => return,
        }
    };
    let cancel = session.cancellation();

    loop {
        let data = tokio::select! {
            () = cancel.cancelled() => break,
            data = pending.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            result = master.write_all(&data) => {
                if let Err(e) = result {
                    warn!(session_id = %session.id(), "Failed to write terminal input: {e}");
                    break;
                }
            }
        }
    }
}

/// Stream terminal output to the controller until end of stream or cancellation.
pub(super) async fn forward_output(session: Arc<TerminalSession>, outbox: Outbox) {
    let Some(master) = session.master().await else {
        return;
    };
    let cancel = session.cancellation();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            result = master.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(session_id = %session.id(), "Terminal output ended");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(session_id = %session.id(), "Terminal read error: {e}");
                    break;
                }
            },
        };

        outbox
            .emit(Envelope::PtyOutput {
                session_id: session.id().to_string(),
                data: buf[..n].to_vec(),
            })
            .await;
    }
}
