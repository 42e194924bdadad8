//! Connection manager.
//!
//! Keeps exactly one WebSocket to the controller alive. Each attempt dials,
//! sends `handshake` and waits for a successful `handshake_ack` before anything
//! else is read or dispatched. A connected session then runs three activities
//! side by side:
//!
//! - the read loop (this task), decoding frames and handing them to the router
//! - a writer task, the only thing that touches the sink, draining the outbox
//! - a heartbeat task, queueing `heartbeat_pong` on its own timer
//!
//! Any transport failure tears all three down and the manager redials after a
//! fixed delay, until shutdown is requested.

use crate::config::{AgentConfig, VERSION};
use crate::exec::ExecRunner;
use crate::host::HostProbe;
use crate::outbox::Outbox;
use crate::protocol::{self, Capability, DecodeError, Envelope};
use crate::router::Router;
use crate::session::SessionRegistry;
use chrono::{SecondsFormat, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport to the controller.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the writer gets to flush and send a close frame on teardown.
const WRITER_FLUSH: Duration = Duration::from_secs(1);

/// Shortest heartbeat period accepted.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Where the manager is in its connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Errors that end a connection attempt or a connected session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("undecodable frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("controller rejected the handshake")]
    HandshakeRejected,

    #[error("expected handshake_ack, got {0}")]
    UnexpectedReply(&'static str),

    #[error("no handshake_ack within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("could not reach {url} within {timeout:?}")]
    DialTimeout { url: String, timeout: Duration },

    #[error("connection closed")]
    Closed,
}

/// A transport whose handshake the controller accepted.
pub struct Connection {
    ws: WsStream,
    agent_id: Option<String>,
    heartbeat_interval: Duration,
}

impl Connection {
    /// Agent ID assigned by the controller, if it sent one.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Heartbeat period in effect for this connection.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

/// Owns the controller connection and everything that talks over it.
pub struct ConnectionManager {
    config: AgentConfig,
    probe: Arc<dyn HostProbe>,
    outbox: Outbox,
    router: Router,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: AgentConfig, probe: Arc<dyn HostProbe>) -> Self {
        let outbox = Outbox::new();
        let sessions = Arc::new(SessionRegistry::new(outbox.clone()));
        let router = Router::new(outbox.clone(), ExecRunner::new(config.exec), sessions);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            probe,
            outbox,
            router,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Sessions live across reconnects; this is the process-wide registry.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionRegistry> {
        self.router.sessions()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Token that stops [`run_forever`](Self::run_forever) when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close the active connection, if any, and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Connection state changed");
        }
    }

    /// Dial the controller and complete the handshake.
    pub async fn connect(&self) -> Result<Connection, ConnectionError> {
        let result = self.try_connect().await;
        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn try_connect(&self) -> Result<Connection, ConnectionError> {
        let url = &self.config.identity.server_url;
        self.set_state(ConnectionState::Connecting);
        info!(%url, "Connecting to controller");

        // The dial and the handshake reply each get the handshake timeout.
        let timeout = self.config.handshake_timeout;
        let (mut ws, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| ConnectionError::DialTimeout {
                    url: url.clone(),
                    timeout,
                })?
                .map_err(|source| ConnectionError::Dial {
                    url: url.clone(),
                    source,
                })?;

        self.set_state(ConnectionState::Handshaking);
        send_envelope(&mut ws, &self.handshake()).await?;

        let reply = tokio::time::timeout(timeout, next_envelope(&mut ws))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(timeout))??;

        match reply {
            Envelope::HandshakeAck {
                success: true,
                agent_id,
                server_time,
                heartbeat_interval,
            } => {
                let heartbeat_interval = heartbeat_interval
                    .filter(|secs| *secs > 0)
                    .map_or(self.config.heartbeat_interval, Duration::from_secs);
                debug!(?server_time, "Handshake accepted");
                Ok(Connection {
                    ws,
                    agent_id,
                    heartbeat_interval,
                })
            }
            Envelope::HandshakeAck { .. } => {
                warn!("Handshake rejected by controller");
                Err(ConnectionError::HandshakeRejected)
            }
            other => Err(ConnectionError::UnexpectedReply(other.kind())),
        }
    }

    fn handshake(&self) -> Envelope {
        let identity = &self.config.identity;
        Envelope::Handshake {
            agent_id: identity.agent_id.clone(),
            token: identity.token.clone(),
            version: VERSION.to_string(),
            name: identity.name.clone(),
            system: self.probe.system_info(),
            capabilities: Capability::ALL.to_vec(),
            tags: identity.tags.clone(),
        }
    }

    /// Serve an accepted connection until it fails or shutdown is requested.
    ///
    /// Returns `Ok(())` only on shutdown.
    pub async fn run(&self, connection: Connection) -> Result<(), ConnectionError> {
        let heartbeat_interval = connection.heartbeat_interval();
        info!(
            agent_id = connection.agent_id().unwrap_or("unassigned"),
            ?heartbeat_interval,
            "Connected to controller"
        );
        let (sink, mut stream) = connection.ws.split();

        let rx = self.outbox.attach().await;
        let mut writer = tokio::spawn(write_loop(sink, rx));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.outbox.clone(),
            Arc::clone(&self.probe),
            Arc::clone(self.sessions()),
            heartbeat_interval,
        ));
        self.set_state(ConnectionState::Connected);

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                written = &mut writer => {
                    break match written {
                        Ok(Err(e)) => Err(e),
                        Ok(Ok(())) | Err(_) => Err(ConnectionError::Closed),
                    };
                }
                message = stream.next() => {
                    let handled = match message {
                        Some(Ok(message)) => self.handle_frame(message).await,
                        Some(Err(e)) => Err(e.into()),
                        None => Err(ConnectionError::Closed),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };

        heartbeat.abort();
        self.outbox.detach().await;
        if !writer.is_finished() && tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
            writer.abort();
        }
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn handle_frame(&self, message: Message) -> Result<(), ConnectionError> {
        if let Message::Close(frame) = &message {
            debug!(?frame, "Controller closed the connection");
            return Err(ConnectionError::Closed);
        }
        let Some(decoded) = decode_frame(&message) else {
            return Ok(());
        };
        match decoded {
            Ok(envelope) => {
                debug!(kind = envelope.kind(), "Received envelope");
                self.router.dispatch(envelope).await;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Dropping inbound envelope: {e}");
                Ok(())
            }
        }
    }

    /// Connect, serve, and reconnect after a fixed delay, until shutdown.
    pub async fn run_forever(&self) {
        let delay = self.config.reconnect_delay;
        loop {
            let connected = tokio::select! {
                () = self.shutdown.cancelled() => break,
                connected = self.connect() => connected,
            };
            let result = match connected {
                Ok(connection) => self.run(connection).await,
                Err(e) => Err(e),
            };
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = result {
                warn!(?delay, "Connection failed: {e}");
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }
}

/// Decode a data frame. Control frames carry no envelope.
fn decode_frame(message: &Message) -> Option<Result<Envelope, DecodeError>> {
    match message {
        Message::Text(text) => Some(protocol::decode(text)),
        Message::Binary(bytes) => Some(protocol::decode_bytes(bytes)),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_) => None,
    }
}

/// Wait for the next envelope, skipping control frames.
async fn next_envelope(ws: &mut WsStream) -> Result<Envelope, ConnectionError> {
    while let Some(message) = ws.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            debug!(?frame, "Controller closed the connection");
            return Err(ConnectionError::Closed);
        }
        if let Some(decoded) = decode_frame(&message) {
            return Ok(decoded?);
        }
    }
    Err(ConnectionError::Closed)
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = envelope.encode().map_err(|source| ConnectionError::Encode {
        kind: envelope.kind(),
        source,
    })?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Drain the outbox onto the wire. Ends cleanly once the outbox is detached.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Envelope>,
) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        match send_envelope(&mut sink, &envelope).await {
            Ok(()) => {}
            Err(e @ ConnectionError::Encode { .. }) => warn!("Skipping outbound envelope: {e}"),
            Err(e) => return Err(e),
        }
    }
    let _ = sink.close().await;
    Ok(())
}

/// Queue a `heartbeat_pong` every period, whatever the read loop is doing.
async fn heartbeat_loop(
    outbox: Outbox,
    probe: Arc<dyn HostProbe>,
    sessions: Arc<SessionRegistry>,
    period: Duration,
) {
    let period = period.max(MIN_HEARTBEAT);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let mut metrics = probe.metrics();
        metrics.active_sessions = sessions.len().await;
        let pong = Envelope::HeartbeatPong {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            metrics,
        };
        if let Err(e) = outbox.send(pong).await {
            debug!("Stopping heartbeat: {e}");
            break;
        }
        debug!("Queued heartbeat");
    }
}
