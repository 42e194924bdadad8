//! The single outbound path to the controller.
//!
//! Any task may emit envelopes through a cloned [`Outbox`]. While a connection
//! is up, the envelopes go into one channel drained by that connection's writer
//! task, so frames never interleave on the wire. While disconnected, envelopes
//! are dropped.

use crate::protocol::Envelope;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Envelopes buffered between producers and the writer.
const CAPACITY: usize = 256;

/// Errors when emitting an envelope.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("not connected")]
    NotConnected,
}

/// Cloneable handle to the current connection's write path.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    tx: Arc<RwLock<Option<mpsc::Sender<Envelope>>>>,
}

impl Outbox {
    /// Create a detached outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes to a new writer, replacing any previous one.
    pub async fn attach(&self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(CAPACITY);
        *self.tx.write().await = Some(tx);
        rx
    }

    /// Stop routing envelopes. The writer sees its channel close once every
    /// in-flight send has finished.
    pub async fn detach(&self) {
        self.tx.write().await.take();
    }

    /// Whether a writer is attached.
    pub async fn is_attached(&self) -> bool {
        self.tx.read().await.is_some()
    }

    /// Queue an envelope for the writer, waiting for room if it is behind.
    pub async fn send(&self, envelope: Envelope) -> Result<(), OutboxError> {
        // Clone the sender so the lock is not held across the await.
        let tx = self.tx.read().await.clone().ok_or(OutboxError::NotConnected)?;
        tx.send(envelope).await.map_err(|_| OutboxError::NotConnected)
    }

    /// Like [`send`](Self::send), logging instead of failing.
    pub async fn emit(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if let Err(e) = self.send(envelope).await {
            debug!(%kind, "Dropping outbound envelope: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_while_detached_fails() {
        let outbox = Outbox::new();
        let result = outbox.send(Envelope::PtyEnd { session_id: "s".into() }).await;
        assert!(matches!(result, Err(OutboxError::NotConnected)));
        assert!(!outbox.is_attached().await);
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_order() {
        let outbox = Outbox::new();
        let mut rx = outbox.attach().await;

        for i in 0..5u16 {
            outbox
                .send(Envelope::PtyResize {
                    session_id: "s".into(),
                    cols: i,
                    rows: i,
                })
                .await
                .unwrap();
        }
        for i in 0..5u16 {
            match rx.recv().await.unwrap() {
                Envelope::PtyResize { cols, .. } => assert_eq!(cols, i),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_detach_closes_writer_channel() {
        let outbox = Outbox::new();
        let mut rx = outbox.attach().await;
        outbox.detach().await;
        assert!(rx.recv().await.is_none());
        // Emitting while detached is silent.
        outbox.emit(Envelope::PtyEnd { session_id: "s".into() }).await;
    }

    #[tokio::test]
    async fn test_reattach_replaces_writer() {
        let outbox = Outbox::new();
        let mut first = outbox.attach().await;
        let mut second = outbox.attach().await;
        assert!(first.recv().await.is_none());

        outbox.send(Envelope::PtyEnd { session_id: "s".into() }).await.unwrap();
        assert!(matches!(second.recv().await, Some(Envelope::PtyEnd { .. })));
    }
}
