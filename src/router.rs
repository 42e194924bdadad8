//! Dispatch of inbound envelopes.

use crate::exec::ExecRunner;
use crate::outbox::Outbox;
use crate::protocol::Envelope;
use crate::session::{SessionRegistry, StartRequest};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes each inbound envelope to the component that handles its kind.
///
/// `exec` and `pty_start` run on their own tasks so the read loop never waits
/// on a process. Session input, resize and end are short lookups and are
/// handled inline, which also keeps input for one session in order.
#[derive(Clone)]
pub struct Router {
    outbox: Outbox,
    runner: ExecRunner,
    sessions: Arc<SessionRegistry>,
}

impl Router {
    #[must_use]
    pub const fn new(outbox: Outbox, runner: ExecRunner, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            outbox,
            runner,
            sessions,
        }
    }

    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handle one envelope. Never fails; problems are reported to the
    /// controller or logged.
    pub async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::HeartbeatPing { .. } => {
                debug!("Received heartbeat ping");
            }

            Envelope::Exec {
                request_id,
                command,
                timeout_seconds,
            } => {
                let runner = self.runner.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let report = runner.run(request_id, &command, timeout_seconds).await;
                    outbox.emit(report.into()).await;
                });
            }

            Envelope::PtyStart {
                session_id,
                request_id,
                shell,
                cols,
                rows,
            } => {
                let sessions = Arc::clone(&self.sessions);
                tokio::spawn(async move {
                    sessions
                        .start(StartRequest {
                            session_id,
                            request_id,
                            shell,
                            cols,
                            rows,
                        })
                        .await;
                });
            }

            Envelope::PtyInput { session_id, data } => {
                self.sessions.input(&session_id, &data).await;
            }

            Envelope::PtyResize {
                session_id,
                cols,
                rows,
            } => {
                self.sessions.resize(&session_id, cols, rows).await;
            }

            Envelope::PtyEnd { session_id } => {
                self.sessions.end(&session_id).await;
            }

            other => {
                warn!(kind = other.kind(), "Ignoring envelope the agent does not handle");
            }
        }
    }
}
