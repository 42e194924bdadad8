//! hive-agent: remote-control agent

use clap::Parser;
use hive_agent::{Cli, Command, ConnectionManager, HostProbe, LocalHost, power};
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("hive_agent=debug")
        } else {
            EnvFilter::new("hive_agent=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_agent(cli.agent).await,
        Command::Info => run_info(),
        Command::Power { action, dry_run } => run_power(action, dry_run).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_agent(args: hive_agent::AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;
    info!(
        server = %config.identity.server_url,
        name = %config.identity.name,
        version = hive_agent::VERSION,
        "Starting agent"
    );

    let manager = ConnectionManager::new(config, Arc::new(LocalHost::new()));
    // Register before connecting so an early SIGTERM is not fatal.
    let terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            None
        }
    };
    tokio::spawn(cancel_on_signal(manager.shutdown_token(), terminate));
    manager.run_forever().await;
    Ok(())
}

/// Cancel `token` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken, mut terminate: Option<Signal>) {
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
        () = sigterm => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}

fn run_info() -> Result<(), Box<dyn std::error::Error>> {
    let probe = LocalHost::new();
    let report = serde_json::json!({
        "version": hive_agent::VERSION,
        "system": probe.system_info(),
        "metrics": probe.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_power(
    action: power::PowerAction,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if dry_run {
        println!("{}", power::command_for(action)?);
        return Ok(());
    }
    power::request_transition(action).await?;
    Ok(())
}
