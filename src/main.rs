//! Binary entry point: a small CLI wrapping the long-running agent
//! (`run`) plus the one-off operator commands that don't belong behind
//! the control API (`pair`, `unpair`, `status`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use bridge_agent::config::{default_app_data_dir, Config, ConfigError};
use bridge_agent::lifecycle::{build_auth, Lifecycle, LifecycleError};
use bridge_agent::pairing::{Pairing, PairingError};

const PAIR_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "bridged")]
#[command(about = "Bridges gym door-access hardware to the cloud control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the agent's config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent and run until interrupted.
    Run,

    /// Pair this device with the cloud control plane using a short-lived code.
    Pair {
        /// Pair code shown in the cloud dashboard.
        pair_code: String,
    },

    /// Forget this device's credentials and stop syncing.
    Unpair,

    /// Print pairing and device status.
    Status,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("{0}")]
    Signal(std::io::Error),
}

/// Maps a failed command (or a clean updater-initiated restart) to the
/// process exit code an operator or supervisor can branch on: 1 for a
/// bad config, 2 for credential/vault trouble, 3 for a corrupt
/// database, 4 when the updater staged a restart, 1 for anything else.
fn exit_code_for(error: &CliError) -> ExitCode {
    match error {
        CliError::Config(_) => ExitCode::from(1),
        CliError::Lifecycle(LifecycleError::Auth(_)) => ExitCode::from(2),
        CliError::Lifecycle(LifecycleError::Queue(e)) if is_database_corruption(e) => {
            ExitCode::from(3)
        }
        CliError::Lifecycle(LifecycleError::Config(_)) => ExitCode::from(1),
        CliError::Pairing(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn is_database_corruption(error: &bridge_agent::queue::QueueError) -> bool {
    matches!(
        error,
        bridge_agent::queue::QueueError::Sqlite(_)
            | bridge_agent::queue::QueueError::MigrationFailed { .. }
    )
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| default_app_data_dir().join("config.yaml"))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let path = config_path(&cli);

    let outcome = match cli.command {
        Command::Run => run(path).await,
        Command::Pair { pair_code } => pair(path, &pair_code).await.map(|_| RunOutcome::Clean),
        Command::Unpair => unpair(path).await.map(|_| RunOutcome::Clean),
        Command::Status => status(path).map(|_| RunOutcome::Clean),
    };

    match outcome {
        Ok(RunOutcome::Clean) => ExitCode::SUCCESS,
        Ok(RunOutcome::RestartRequested) => {
            tracing::info!("restarting for a staged update");
            ExitCode::from(4)
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            exit_code_for(&e)
        }
    }
}

/// Distinguishes a clean stop from a stop triggered by the updater
/// staging a new version, so `main` can map the latter to its own
/// exit code for the process supervisor to act on.
enum RunOutcome {
    Clean,
    RestartRequested,
}

async fn run(config_path: PathBuf) -> Result<RunOutcome, CliError> {
    let mut lifecycle = Lifecycle::bootstrap(config_path).await?;
    tracing::info!(
        addr = ?lifecycle.control_api_addr(),
        "bridge agent running, control API listening"
    );

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(CliError::Signal)?;
            tracing::info!("shutdown requested, stopping subsystems");
            RunOutcome::Clean
        }
        _ = lifecycle.wait_for_restart_request() => {
            tracing::info!("update staged, stopping subsystems for restart");
            RunOutcome::RestartRequested
        }
    };

    lifecycle.shutdown().await;
    Ok(outcome)
}

async fn pair(config_path: PathBuf, pair_code: &str) -> Result<(), CliError> {
    let config = Config::load(&config_path)?;
    let auth = build_auth(&config)?;
    let pairing = Pairing::new(auth, config.server_url.clone());
    pairing.pair(pair_code, PAIR_DEADLINE).await?;
    println!("device paired successfully");
    Ok(())
}

async fn unpair(config_path: PathBuf) -> Result<(), CliError> {
    let config = Config::load(&config_path)?;
    let auth = build_auth(&config)?;
    let pairing = Pairing::new(auth, config.server_url.clone());
    pairing.unpair().await?;
    println!("device unpaired");
    Ok(())
}

fn status(config_path: PathBuf) -> Result<(), CliError> {
    let config = Config::load(&config_path)?;
    let auth = build_auth(&config)?;

    if auth.is_authenticated() {
        println!("paired: yes");
        println!("device_id: {}", auth.device_id().unwrap_or_default());
    } else {
        println!("paired: no");
    }
    println!("server_url: {}", config.server_url);
    println!("tier: {}", config.tier.map(|t| t.to_string()).unwrap_or_else(|| "auto".to_string()));
    Ok(())
}
