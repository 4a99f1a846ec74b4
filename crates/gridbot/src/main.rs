//! Gridbot - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Grid and DCA trading bot supervisor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via GRIDBOT_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config path: CLI arg > GRIDBOT_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("GRIDBOT_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = gridbot::AppConfig::from_file(&config_path)?;

    gridbot_telemetry::init_logging(&config.logging)?;
    info!("Starting gridbot v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        accounts = config.accounts.len(),
        bots = config.bots.len(),
        "Configuration loaded"
    );

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let supervisor = gridbot::Supervisor::new(config)?;
    supervisor.run().await?;

    Ok(())
}
