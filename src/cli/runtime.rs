use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soulbrowser_envelope::SigningKey;

use crate::config::ControlConfig;

pub fn init_logging(level: &str, debug: bool, json: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}

/// Load the configured PEM key. A configured path that does not exist yet receives a freshly
/// generated key, so restarts keep the same `kid`. Without a path the key lives in memory only.
pub async fn load_signing_key(config: &ControlConfig) -> Result<SigningKey> {
    let Some(path) = config.signing_key_path.as_ref() else {
        let key = SigningKey::generate().context("failed to generate signing key")?;
        warn!(kid = key.kid(), "no signing key configured; using an ephemeral key");
        return Ok(key);
    };

    if path.exists() {
        let pem = fs::read(path)
            .await
            .with_context(|| format!("failed to read signing key {}", path.display()))?;
        let key = SigningKey::from_pem(&pem)
            .with_context(|| format!("invalid signing key {}", path.display()))?;
        info!(kid = key.kid(), path = %path.display(), "Loaded signing key");
        return Ok(key);
    }

    let key = SigningKey::generate().context("failed to generate signing key")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let pem = key.to_pem().context("failed to encode signing key")?;
    fs::write(path, pem)
        .await
        .with_context(|| format!("failed to write signing key {}", path.display()))?;
    info!(kid = key.kid(), path = %path.display(), "Generated signing key");
    Ok(key)
}
