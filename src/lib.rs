//! hive-agent: remote-control agent
//!
//! Keeps one WebSocket open to a controller and serves it: one-shot shell
//! commands, interactive terminal sessions, and periodic heartbeats carrying
//! host metrics.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod connection;
pub mod exec;
pub mod host;
pub mod outbox;
pub mod power;
pub mod protocol;
pub mod pty;
pub mod router;
pub mod session;
pub mod testing;

pub use cli::{AgentArgs, Cli, Command};
pub use config::{AgentConfig, AgentIdentity, ConfigError, ExecConfig, VERSION};
pub use connection::{Connection, ConnectionError, ConnectionManager, ConnectionState};
pub use exec::{ExecReport, ExecRunner};
pub use host::{HostProbe, LocalHost, Metrics, SystemInfo};
pub use outbox::{Outbox, OutboxError};
pub use protocol::{DecodeError, Envelope, decode};
pub use router::Router;
pub use session::{SessionRegistry, SessionState, TerminalSession};
pub use testing::{ControllerPeer, MockController, StaticProbe, TestError};
