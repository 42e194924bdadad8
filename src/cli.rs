//! Command-line interface for hive-agent.

use crate::config::{AgentConfig, AgentIdentity, ConfigError, ExecConfig};
use crate::host;
use crate::power::PowerAction;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Remote-control agent for a hive controller.
#[derive(Debug, Parser)]
#[command(name = "hive-agent", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub agent: AgentArgs,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Identity and timing flags for the connection.
#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Controller WebSocket URL.
    #[arg(global = true, long, env = "HIVE_SERVER_URL", default_value = "ws://localhost:3000/ws/agent")]
    pub server: String,

    /// Agent ID (leave empty to let the controller assign one).
    #[arg(global = true, long, env = "HIVE_AGENT_ID", default_value = "")]
    pub id: String,

    /// Shared secret presented at handshake.
    #[arg(global = true, long, env = "HIVE_AGENT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Display name (defaults to the host name).
    #[arg(global = true, long, env = "HIVE_AGENT_NAME")]
    pub name: Option<String>,

    /// Tag reported at handshake (repeat, or comma-separate).
    #[arg(global = true, long = "tag", env = "HIVE_AGENT_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Seconds between heartbeats.
    #[arg(global = true, long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_secs: u64,

    /// Seconds to wait before reconnecting.
    #[arg(global = true, long, default_value = "5")]
    pub reconnect_secs: u64,

    /// Default timeout for exec requests, in seconds.
    #[arg(global = true, long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    pub exec_timeout_secs: u64,

    /// Capture limit for each of stdout and stderr, in bytes.
    #[arg(global = true, long, default_value = "1048576")]
    pub max_output_bytes: usize,
}

impl AgentArgs {
    /// Build the runtime configuration. Fails without a token.
    pub fn into_config(self) -> Result<AgentConfig, ConfigError> {
        let token = self
            .token
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        if self.server.trim().is_empty() {
            return Err(ConfigError::EmptyServerUrl);
        }

        let identity = AgentIdentity {
            server_url: self.server,
            agent_id: self.id,
            token,
            name: self
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(host::hostname),
            tags: self.tags.into_iter().filter(|tag| !tag.is_empty()).collect(),
        };

        Ok(AgentConfig::new(identity)
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_secs))
            .with_reconnect_delay(Duration::from_secs(self.reconnect_secs))
            .with_exec(ExecConfig {
                default_timeout: Duration::from_secs(self.exec_timeout_secs),
                max_output_bytes: self.max_output_bytes,
            }))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the controller and serve requests until interrupted.
    Run,

    /// Print this host's system facts and a metrics sample as JSON.
    Info,

    /// Request a power-state transition.
    Power {
        /// Transition to request.
        #[arg(value_enum)]
        action: PowerAction,

        /// Print the command instead of running it.
        #[arg(long)]
        dry_run: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("hive-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_run_is_default() {
        let cli = parse(&["--token", "t"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.agent.server, "ws://localhost:3000/ws/agent");
    }

    #[test]
    fn test_tags_repeat_and_split() {
        let cli = parse(&["--tag", "a,b", "--tag", "c", "run"]);
        assert_eq!(cli.agent.tags, vec!["a", "b", "c"]);
        assert!(matches!(cli.command, Some(Command::Run)));
    }

    #[test]
    fn test_into_config() {
        let cli = parse(&[
            "--token",
            "secret",
            "--name",
            "edge-1",
            "--heartbeat-secs",
            "10",
            "--max-output-bytes",
            "64",
        ]);
        let config = cli.agent.into_config().unwrap();
        assert_eq!(config.identity.token, "secret");
        assert_eq!(config.identity.name, "edge-1");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.exec.max_output_bytes, 64);
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let mut args = parse(&[]).agent;
        args.token = None;
        assert!(matches!(args.into_config(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_name_defaults_to_hostname() {
        let mut args = parse(&["--token", "t"]).agent;
        args.name = None;
        let config = args.into_config().unwrap();
        assert_eq!(config.identity.name, host::hostname());
    }

    #[test]
    fn test_power_action_parses() {
        let cli = parse(&["power", "hibernate", "--dry-run"]);
        assert!(matches!(
            cli.command,
            Some(Command::Power { action: PowerAction::Hibernate, dry_run: true })
        ));
        assert!(Cli::try_parse_from(["hive-agent", "power", "nap"]).is_err());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        assert!(Cli::try_parse_from(["hive-agent", "--heartbeat-secs", "0"]).is_err());
    }
}
