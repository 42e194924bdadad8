//! Power-state transitions.
//!
//! Each action maps to the command the host platform provides for it. Only the
//! command table knows which platform it is on.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Shutdown,
    Reboot,
    Sleep,
    Hibernate,
}

impl PowerAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
            Self::Sleep => "sleep",
            Self::Hibernate => "hibernate",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("{action} is not supported on {os}")]
    Unsupported { action: PowerAction, os: &'static str },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: PowerCommand,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Failed {
        command: PowerCommand,
        status: std::process::ExitStatus,
    },
}

/// A platform command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerCommand {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl PowerCommand {
    const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self { program, args }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Command for `action` on Linux. `systemd` says whether `systemctl` is available.
pub const fn linux_command(action: PowerAction, systemd: bool) -> Result<PowerCommand, PowerError> {
    let command = match (action, systemd) {
        (PowerAction::Shutdown, true) => PowerCommand::new("systemctl", &["poweroff"]),
        (PowerAction::Reboot, true) => PowerCommand::new("systemctl", &["reboot"]),
        (PowerAction::Sleep, true) => PowerCommand::new("systemctl", &["suspend"]),
        (PowerAction::Hibernate, true) => PowerCommand::new("systemctl", &["hibernate"]),
        (PowerAction::Shutdown, false) => PowerCommand::new("shutdown", &["-h", "now"]),
        (PowerAction::Reboot, false) => PowerCommand::new("shutdown", &["-r", "now"]),
        (PowerAction::Sleep | PowerAction::Hibernate, false) => {
            return Err(PowerError::Unsupported {
                action,
                os: "linux without systemd",
            });
        }
    };
    Ok(command)
}

/// Command for `action` on macOS. There is no separate hibernate; it sleeps.
pub const fn macos_command(action: PowerAction) -> PowerCommand {
    match action {
        PowerAction::Shutdown => PowerCommand::new("shutdown", &["-h", "now"]),
        PowerAction::Reboot => PowerCommand::new("shutdown", &["-r", "now"]),
        PowerAction::Sleep | PowerAction::Hibernate => PowerCommand::new("pmset", &["sleepnow"]),
    }
}

/// Command for `action` on this host.
pub fn command_for(action: PowerAction) -> Result<PowerCommand, PowerError> {
    match std::env::consts::OS {
        "linux" => linux_command(action, on_path("systemctl")),
        "macos" => Ok(macos_command(action)),
        os => Err(PowerError::Unsupported { action, os }),
    }
}

/// Run the command for `action` and wait for it.
pub async fn request_transition(action: PowerAction) -> Result<(), PowerError> {
    let command = command_for(action)?;
    info!(%action, %command, "Requesting power transition");

    let status = Command::new(command.program)
        .args(command.args)
        .status()
        .await
        .map_err(|source| PowerError::Spawn { command, source })?;
    if !status.success() {
        return Err(PowerError::Failed { command, status });
    }
    Ok(())
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_prefers_systemctl() {
        let command = linux_command(PowerAction::Sleep, true).unwrap();
        assert_eq!(command.to_string(), "systemctl suspend");
        let command = linux_command(PowerAction::Shutdown, true).unwrap();
        assert_eq!(command.to_string(), "systemctl poweroff");
    }

    #[test]
    fn test_linux_fallback_without_systemd() {
        assert_eq!(
            linux_command(PowerAction::Reboot, false).unwrap().to_string(),
            "shutdown -r now"
        );
        assert!(matches!(
            linux_command(PowerAction::Hibernate, false),
            Err(PowerError::Unsupported { action: PowerAction::Hibernate, .. })
        ));
    }

    #[test]
    fn test_macos_table() {
        assert_eq!(macos_command(PowerAction::Shutdown).to_string(), "shutdown -h now");
        assert_eq!(macos_command(PowerAction::Hibernate).to_string(), "pmset sleepnow");
    }

    #[test]
    fn test_action_names() {
        assert_eq!(PowerAction::Hibernate.to_string(), "hibernate");
        assert_eq!(
            serde_json::to_string(&PowerAction::Sleep).unwrap(),
            "\"sleep\""
        );
    }

    #[test]
    fn test_on_path_finds_sh() {
        assert!(on_path("sh"));
        assert!(!on_path("definitely-not-a-real-program-name"));
    }
}
