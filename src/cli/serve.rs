use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Args;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::control::ControlPlane;
use crate::server::build_router;

use super::runtime::load_signing_key;

#[derive(Args, Clone)]
pub struct ServeArgs {
    /// Listen port (overrides the config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Origin agents use to reach this server, e.g. https://control.example
    #[arg(long)]
    pub public_origin: Option<String>,
}

pub async fn cmd_serve(args: ServeArgs, mut config: ControlConfig) -> Result<()> {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if args.public_origin.is_some() {
        config.public_origin = args.public_origin;
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let signing_key = load_signing_key(&config).await?;
    let origin = config.origin();
    let plane = ControlPlane::new(config, signing_key);
    plane.start();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control server on {}", addr))?;
    info!("Control server listening on http://{}", addr);
    info!("Key set published at {}/.well-known/jwks.json", origin);

    let router = build_router(plane.clone());
    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control server exited unexpectedly");

    plane.stop().await;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
