use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use super::commands::Commands;
use super::env::CliArgs;
use super::keys::{cmd_jwks, cmd_verify};
use super::runtime::init_logging;
use super::serve::cmd_serve;
use crate::config::ControlConfig;
use crate::metrics;

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();

    init_logging(&cli.log_level, cli.debug, cli.log_json)?;
    let _metrics_server = metrics::spawn_metrics_server(cli.metrics_port);

    info!("Starting soulbrowser-control v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ControlConfig::load(cli.config.as_ref()).await?;
    config.apply_env_overrides();

    let outcome = match cli.command {
        Commands::Serve(args) => cmd_serve(args, config).await,
        Commands::Jwks(args) => cmd_jwks(args, &config).await,
        Commands::Verify(args) => cmd_verify(args, &config).await,
    };
    match outcome {
        Ok(()) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}
