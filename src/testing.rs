//! Test framework for agent/controller scenarios.
//!
//! Stands in for the controller so connection behaviour can be driven from
//! either end:
//!
//! ```ignore
//! let controller = MockController::bind().await?;
//! let manager = Arc::new(ConnectionManager::new(
//!     test_config(&controller.url()),
//!     Arc::new(StaticProbe::default()),
//! ));
//! tokio::spawn({ let m = Arc::clone(&manager); async move { m.run_forever().await } });
//!
//! let mut peer = controller.accept().await?;
//! peer.accept_handshake().await?;
//! peer.send(&Envelope::Exec { .. }).await?;
//! let result = peer.recv_kind("exec_result", Duration::from_secs(5)).await?;
//! ```

use crate::config::{AgentConfig, AgentIdentity};
use crate::host::{HostProbe, Metrics, SystemInfo};
use crate::protocol::{self, DecodeError, Envelope};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

/// How long `accept` and the handshake helpers wait by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("agent closed the connection")]
    Closed,

    #[error("unexpected envelope: {0}")]
    Unexpected(String),
}

/// A controller endpoint listening on a loopback port.
pub struct MockController {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockController {
    /// Listen on an ephemeral loopback port.
    pub async fn bind() -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/ws/agent", self.addr)
    }

    /// Accept the next agent connection.
    pub async fn accept(&self) -> Result<ControllerPeer, TestError> {
        self.accept_within(DEFAULT_TIMEOUT).await
    }

    pub async fn accept_within(&self, timeout: Duration) -> Result<ControllerPeer, TestError> {
        let accepted = async {
            let (stream, _) = self.listener.accept().await?;
            let ws = tokio_tungstenite::accept_async(stream).await?;
            Ok::<_, TestError>(ws)
        };
        let ws = tokio::time::timeout(timeout, accepted)
            .await
            .map_err(|_| TestError::Timeout)??;
        Ok(ControllerPeer { ws })
    }
}

/// The controller's side of one agent connection.
pub struct ControllerPeer {
    ws: WebSocketStream<TcpStream>,
}

impl ControllerPeer {
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TestError> {
        self.send_raw(&envelope.encode()?).await
    }

    /// Send a text frame as is, valid or not.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), TestError> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next envelope from the agent.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Envelope, TestError> {
        let next = async {
            while let Some(message) = self.ws.next().await {
                match message? {
                    Message::Text(text) => return Ok(protocol::decode(&text)?),
                    Message::Binary(bytes) => return Ok(protocol::decode_bytes(&bytes)?),
                    Message::Close(_) => return Err(TestError::Closed),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            Err(TestError::Closed)
        };
        tokio::time::timeout(timeout, next)
            .await
            .map_err(|_| TestError::Timeout)?
    }

    /// Next envelope accepted by `matches`, skipping everything else.
    pub async fn recv_matching<F>(
        &mut self,
        timeout: Duration,
        mut matches: F,
    ) -> Result<Envelope, TestError>
    where
        F: FnMut(&Envelope) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TestError::Timeout);
            }
            let envelope = self.recv(remaining).await?;
            if matches(&envelope) {
                return Ok(envelope);
            }
        }
    }

    /// Next envelope of the given kind.
    pub async fn recv_kind(&mut self, kind: &str, timeout: Duration) -> Result<Envelope, TestError> {
        self.recv_matching(timeout, |envelope| envelope.kind() == kind)
            .await
    }

    /// Wait for the agent's `handshake`.
    pub async fn expect_handshake(&mut self) -> Result<Envelope, TestError> {
        match self.recv(DEFAULT_TIMEOUT).await? {
            envelope @ Envelope::Handshake { .. } => Ok(envelope),
            other => Err(TestError::Unexpected(other.kind().to_string())),
        }
    }

    /// Wait for the `handshake` and acknowledge it.
    pub async fn accept_handshake(&mut self) -> Result<Envelope, TestError> {
        let handshake = self.expect_handshake().await?;
        self.send(&Envelope::HandshakeAck {
            success: true,
            agent_id: Some("agent-under-test".into()),
            server_time: None,
            heartbeat_interval: None,
        })
        .await?;
        Ok(handshake)
    }

    /// Close the connection from the controller side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Host probe with fixed answers.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    pub system: SystemInfo,
    pub metrics: Metrics,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            system: SystemInfo {
                hostname: "test-host".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                cpu_cores: 4,
                memory_total_mb: 8192,
                ..SystemInfo::default()
            },
            metrics: Metrics {
                cpu_percent: 12.5,
                memory_percent: 40.0,
                load_avg_1: 0.5,
                ..Metrics::default()
            },
        }
    }
}

impl HostProbe for StaticProbe {
    fn system_info(&self) -> SystemInfo {
        self.system.clone()
    }

    fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }
}

/// Agent configuration pointed at `url`, with short delays for tests.
#[must_use]
pub fn test_config(url: &str) -> AgentConfig {
    AgentConfig::new(AgentIdentity {
        server_url: url.to_string(),
        agent_id: String::new(),
        token: "test-token".into(),
        name: "test-agent".into(),
        tags: vec!["test".into()],
    })
    .with_reconnect_delay(Duration::from_millis(200))
    .with_handshake_timeout(Duration::from_secs(2))
}
