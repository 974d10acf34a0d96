//! sshtun - keep SSH port forwards alive

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use sshtun_cli::config::{default_config_path, TunnelConfig};
use sshtun_cli::logging::init_logging;
use sshtun_client::TunnelSupervisor;
use sshtun_transport_ssh::{KeyFileCredentialProvider, SshConnector};

/// Persistent SSH tunnels (local and remote port forwarding)
#[derive(Parser, Debug)]
#[command(name = "sshtun")]
#[command(about = "Keep a set of SSH tunnels up until told to stop", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// What to do with the configured tunnels
    #[arg(short, long, value_enum, default_value_t = Mode::Tunnel)]
    mode: Mode,

    /// Tunnel configuration file (defaults to <exe dir>/config/config.toml)
    #[arg(short = 'f', long, env = "SSHTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Refuse to start if any tunnel is invalid
    #[arg(long)]
    strict: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run the tunnels until SIGINT/SIGTERM
    #[value(alias = "t")]
    Tunnel,
    /// Print the resolved configuration and exit
    #[value(alias = "l")]
    Print,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    let path = cli.config.unwrap_or_else(default_config_path);
    let config = TunnelConfig::load(&path)
        .with_context(|| format!("Failed to load tunnel configuration from {:?}", path))?;

    match cli.mode {
        Mode::Print => {
            print!("{}", config);
            Ok(())
        }
        Mode::Tunnel => run_tunnels(config, cli.strict).await,
    }
}

async fn run_tunnels(config: TunnelConfig, strict: bool) -> Result<()> {
    let specs = config.into_runnable(strict)?;
    let connector = Arc::new(SshConnector::new(Arc::new(KeyFileCredentialProvider::new())));
    let supervisor = TunnelSupervisor::new(specs, connector);

    // Fail before starting anything if signals cannot be watched
    let shutdown = shutdown_signal()?;

    info!("sshtun starting");
    supervisor.run(shutdown).await;
    info!("sshtun shutdown");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM
#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM - initiating shutdown"),
            _ = sigint.recv() => info!("received SIGINT - initiating shutdown"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C - initiating shutdown");
        }
    })
}
