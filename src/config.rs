//! Agent configuration.
//!
//! Built once at startup (from the CLI, see [`crate::cli`]) and read-only for
//! the rest of the process lifetime.

use std::time::Duration;
use thiserror::Error;

/// Agent version reported at handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Startup configuration problems. These are the only errors that stop the agent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("an agent token is required (--token or HIVE_AGENT_TOKEN)")]
    MissingToken,

    #[error("controller URL is empty")]
    EmptyServerUrl,
}

/// Who this agent is and where its controller lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// WebSocket URL of the controller.
    pub server_url: String,
    /// Agent ID (empty lets the controller assign one).
    pub agent_id: String,
    /// Shared secret presented at handshake.
    pub token: String,
    /// Display name.
    pub name: String,
    /// Tags reported at handshake.
    pub tags: Vec<String>,
}

/// Limits for one-shot command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecConfig {
    /// Used when a request has no timeout or a zero timeout.
    pub default_timeout: Duration,
    /// Per-stream capture bound for stdout and stderr.
    pub max_output_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Everything the agent needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub identity: AgentIdentity,
    /// Period between heartbeats unless the controller asks for another.
    pub heartbeat_interval: Duration,
    /// Fixed delay between failed connection attempts.
    pub reconnect_delay: Duration,
    /// Bound on the wait for `handshake_ack`.
    pub handshake_timeout: Duration,
    pub exec: ExecConfig,
}

impl AgentConfig {
    /// Configuration with the default timings.
    #[must_use]
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            exec: ExecConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }
}
