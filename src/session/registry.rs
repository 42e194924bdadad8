//! Session registry.

use super::terminal::{TerminalSession, forward_input, forward_output};
use crate::exec::kill_group;
use crate::outbox::Outbox;
use crate::protocol::{EndReason, Envelope, ErrorCode};
use crate::pty;
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep forwarding output after the shell has exited.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// How long a shell may linger after its terminal output has ended.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// A `pty_start` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub session_id: String,
    pub request_id: Option<String>,
    pub shell: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// What ended the wait on a running session.
enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    OutputClosed,
    Terminated,
}

/// All live terminal sessions, keyed by controller-assigned ID.
///
/// Lookups share the map; inserts and removals take it exclusively. Every
/// path that changes the map goes through these methods.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    outbox: Outbox,
}

impl SessionRegistry {
    /// Create an empty registry emitting through `outbox`.
    #[must_use]
    pub fn new(outbox: Outbox) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            outbox,
        }
    }

    /// Get a session by ID.
    pub async fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// IDs of all registered sessions.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Get the number of sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if there are no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Insert unless the ID is taken.
    async fn insert(&self, session: Arc<TerminalSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return false;
        }
        sessions.insert(session.id().to_string(), session);
        true
    }

    async fn remove(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Handle `pty_start`: spawn the shell, register it, reply with
    /// `pty_started` and start the session's writer, reader and waiter tasks. Failures
    /// are reported with a `PTY_START_FAILED` error envelope.
    pub async fn start(self: &Arc<Self>, request: StartRequest) {
        let StartRequest {
            session_id,
            request_id,
            shell,
            cols,
            rows,
        } = request;

        let shell = shell
            .filter(|s| !s.is_empty())
            .unwrap_or_else(pty::default_shell);
        let size = match (rows, cols) {
            (Some(rows), Some(cols)) if rows > 0 && cols > 0 => Some((rows, cols)),
            _ => None,
        };
        info!(%session_id, %shell, ?size, "Starting terminal session");

        if self.sessions.read().await.contains_key(&session_id) {
            self.start_failed(session_id, request_id, "session already exists")
                .await;
            return;
        }

        let (session, mut child) = match TerminalSession::spawn(session_id.clone(), &shell, size) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.start_failed(session_id, request_id, e.to_string()).await;
                return;
            }
        };

        if !self.insert(Arc::clone(&session)).await {
            // Lost a race with a concurrent start for the same ID.
            session.close().await;
            kill_group(&mut child);
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            self.start_failed(session_id, request_id, "session already exists")
                .await;
            return;
        }

        let pid = session.pid();
        self.outbox
            .emit(Envelope::PtyStarted {
                request_id,
                session_id: session_id.clone(),
                success: true,
                pid,
            })
            .await;
        session.mark_running().await;
        info!(%session_id, %pid, "Terminal session started");

        tokio::spawn(forward_input(Arc::clone(&session)));
        let reader = tokio::spawn(forward_output(Arc::clone(&session), self.outbox.clone()));
        tokio::spawn(Arc::clone(self).supervise(session, child, reader));
    }

    async fn start_failed(
        &self,
        session_id: String,
        request_id: Option<String>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(%session_id, "Failed to start terminal session: {message}");
        self.outbox
            .emit(Envelope::error(
                ErrorCode::PtyStartFailed,
                message,
                request_id,
                Some(session_id),
            ))
            .await;
    }

    /// Handle `pty_input`. Unknown or closed sessions are ignored. Never waits
    /// on the terminal itself.
    pub async fn input(&self, session_id: &str, data: &[u8]) {
        let Some(session) = self.get(session_id).await else {
            debug!(%session_id, "Input for unknown session");
            return;
        };
        match session.write_input(data).await {
            Ok(true) => {}
            Ok(false) => debug!(%session_id, "Input for closed session"),
            Err(e) => warn!(%session_id, "Failed to write terminal input: {e}"),
        }
    }

    /// Handle `pty_resize`. Unknown or closed sessions are ignored.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let Some(session) = self.get(session_id).await else {
            debug!(%session_id, "Resize for unknown session");
            return;
        };
        match session.resize(rows, cols).await {
            Ok(true) => debug!(%session_id, %rows, %cols, "Resized terminal"),
            Ok(false) => debug!(%session_id, "Resize for closed session"),
            Err(e) => warn!(%session_id, "Failed to resize terminal: {e}"),
        }
    }

    /// Handle `pty_end`. The waiter task kills the shell and reports
    /// `pty_ended`; repeated requests are ignored.
    pub async fn end(&self, session_id: &str) {
        let Some(session) = self.get(session_id).await else {
            debug!(%session_id, "End for unknown session");
            return;
        };
        if session.terminate().await {
            info!(%session_id, "Terminating terminal session");
        }
    }

    /// Wait for the session to finish, whichever way it happens, then report
    /// it exactly once and forget it.
    async fn supervise(
        self: Arc<Self>,
        session: Arc<TerminalSession>,
        mut child: Child,
        mut reader: JoinHandle<()>,
    ) {
        let cancel = session.cancellation();
        let trigger = tokio::select! {
            status = child.wait() => Trigger::Exited(status),
            _ = &mut reader => Trigger::OutputClosed,
            () = cancel.cancelled() => Trigger::Terminated,
        };

        let (status, reason) = match trigger {
            Trigger::Exited(status) => {
                // Let the reader forward what the shell wrote before exiting.
                if tokio::time::timeout(OUTPUT_DRAIN, &mut reader).await.is_err() {
                    cancel.cancel();
                    let _ = reader.await;
                }
                (status.ok(), EndReason::Exited)
            }
            Trigger::OutputClosed => {
                let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        kill_group(&mut child);
                        child.wait().await.ok()
                    }
                };
                (status, EndReason::Exited)
            }
            Trigger::Terminated => {
                kill_group(&mut child);
                let status = child.wait().await.ok();
                let _ = reader.await;
                (status, EndReason::Terminated)
            }
        };

        let exit_code = status.and_then(|s| s.code()).unwrap_or(0);
        let session_id = session.id().to_string();
        if session.close().await {
            info!(%session_id, %exit_code, ?reason, "Terminal session ended");
            self.outbox
                .emit(Envelope::PtyEnded {
                    session_id: session_id.clone(),
                    exit_code,
                    reason,
                })
                .await;
        }
        self.remove(&session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn setup() -> (Arc<SessionRegistry>, mpsc::Receiver<Envelope>) {
        let outbox = Outbox::new();
        let rx = outbox.attach().await;
        (Arc::new(SessionRegistry::new(outbox)), rx)
    }

    fn start_request(session_id: &str) -> StartRequest {
        StartRequest {
            session_id: session_id.into(),
            request_id: Some(format!("req-{session_id}")),
            shell: Some("/bin/sh".into()),
            cols: Some(80),
            rows: Some(24),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbox closed")
    }

    /// Skip output until a non-output envelope arrives, returning the output seen.
    async fn next_non_output(rx: &mut mpsc::Receiver<Envelope>) -> (Vec<u8>, Envelope) {
        let mut output = Vec::new();
        loop {
            match next(rx).await {
                Envelope::PtyOutput { data, .. } => output.extend(data),
                other => return (output, other),
            }
        }
    }

    #[tokio::test]
    async fn test_start_replies_with_pid() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("s1")).await;

        match next(&mut rx).await {
            Envelope::PtyStarted {
                request_id,
                session_id,
                success,
                pid,
            } => {
                assert_eq!(request_id.as_deref(), Some("req-s1"));
                assert_eq!(session_id, "s1");
                assert!(success);
                assert!(pid > 0);
            }
            other => panic!("expected PtyStarted, got {other:?}"),
        }
        assert_eq!(registry.len().await, 1);
        registry.end("s1").await;
    }

    #[tokio::test]
    async fn test_start_failure_is_not_registered() {
        let (registry, mut rx) = setup().await;
        let mut request = start_request("bad");
        request.shell = Some("/nonexistent/shell".into());
        registry.start(request).await;

        match next(&mut rx).await {
            Envelope::Error {
                request_id,
                session_id,
                error,
            } => {
                assert_eq!(error.code, ErrorCode::PtyStartFailed);
                assert_eq!(request_id.as_deref(), Some("req-bad"));
                assert_eq!(session_id.as_deref(), Some("bad"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_session_id_rejected() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("dup")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        registry.start(start_request("dup")).await;
        let (_, envelope) = next_non_output(&mut rx).await;
        assert!(matches!(
            envelope,
            Envelope::Error { error, .. } if error.code == ErrorCode::PtyStartFailed
        ));
        assert_eq!(registry.len().await, 1);
        registry.end("dup").await;
    }

    #[tokio::test]
    async fn test_input_is_echoed() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("echo")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        registry.input("echo", b"echo marker-$((6 * 7))\n").await;
        let mut output = Vec::new();
        while !String::from_utf8_lossy(&output).contains("marker-42") {
            match next(&mut rx).await {
                Envelope::PtyOutput { session_id, data } => {
                    assert_eq!(session_id, "echo");
                    output.extend(data);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        registry.end("echo").await;
    }

    #[tokio::test]
    async fn test_resize_keeps_session_running() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("resize")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        let session = registry.get("resize").await.unwrap();
        assert_eq!(session.size().await, (24, 80));

        registry.resize("resize", 120, 40).await;
        assert_eq!(session.size().await, (40, 120));

        registry.input("resize", b"stty size\n").await;
        let mut output = Vec::new();
        while !String::from_utf8_lossy(&output).contains("40 120") {
            if let Envelope::PtyOutput { data, .. } = next(&mut rx).await {
                output.extend(data);
            }
        }
        assert_eq!(
            session.state().await,
            crate::session::SessionState::Running
        );
        registry.end("resize").await;
    }

    #[tokio::test]
    async fn test_end_reports_once() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("end")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        registry.end("end").await;
        registry.end("end").await;

        let (_, envelope) = next_non_output(&mut rx).await;
        match envelope {
            Envelope::PtyEnded {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, "end");
                assert_eq!(reason, EndReason::Terminated);
            }
            other => panic!("expected PtyEnded, got {other:?}"),
        }

        // A third request after removal is a no-op too.
        registry.end("end").await;
        let extra = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(Envelope::PtyOutput { .. }) => {}
                    other => return other,
                }
            }
        })
        .await;
        assert!(extra.is_err(), "unexpected envelope: {extra:?}");
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_input_to_stalled_terminal_does_not_block_end() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("stall")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        // The shell stops reading its terminal.
        registry.input("stall", b"stty raw -echo; sleep 60\n").await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let flood = vec![b'a'; 1 << 20];
        tokio::time::timeout(Duration::from_secs(3), async {
            registry.input("stall", &flood).await;
            registry.input("stall", b"more\n").await;
        })
        .await
        .expect("input waited on the terminal");

        tokio::time::timeout(Duration::from_secs(3), registry.end("stall"))
            .await
            .expect("end waited on pending input");
        let (_, envelope) = next_non_output(&mut rx).await;
        match envelope {
            Envelope::PtyEnded {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, "stall");
                assert_eq!(reason, EndReason::Terminated);
            }
            other => panic!("expected PtyEnded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_natural_exit_reports_exit_code() {
        let (registry, mut rx) = setup().await;
        registry.start(start_request("exit")).await;
        assert!(matches!(next(&mut rx).await, Envelope::PtyStarted { .. }));

        registry.input("exit", b"echo bye; exit 7\n").await;
        let (output, envelope) = next_non_output(&mut rx).await;
        assert!(String::from_utf8_lossy(&output).contains("bye"));
        match envelope {
            Envelope::PtyEnded {
                exit_code, reason, ..
            } => {
                assert_eq!(exit_code, 7);
                assert_eq!(reason, EndReason::Exited);
            }
            other => panic!("expected PtyEnded, got {other:?}"),
        }

        // Give the waiter a moment to deregister.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("exit").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session_operations_are_noops() {
        let (registry, mut rx) = setup().await;
        registry.input("ghost", b"ls\n").await;
        registry.resize("ghost", 100, 30).await;
        registry.end("ghost").await;

        let nothing = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(nothing.is_err());
        assert!(registry.ids().await.is_empty());
    }
}
