use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use soulbrowser_envelope::{HttpJwksSource, JwksCache, Verifier};

use crate::config::ControlConfig;

use super::runtime::load_signing_key;

#[derive(Args, Clone)]
pub struct JwksArgs {
    /// Pretty-print the key set
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Clone)]
pub struct VerifyArgs {
    /// Compact JWS to verify
    pub jws: String,

    /// Key set URL (defaults to the configured one)
    #[arg(long)]
    pub jwks_url: Option<String>,

    /// Accepted clock skew in milliseconds
    #[arg(long)]
    pub clock_skew_ms: Option<u64>,
}

pub async fn cmd_jwks(args: JwksArgs, config: &ControlConfig) -> Result<()> {
    let key = load_signing_key(config).await?;
    let jwks = key.jwks();
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&jwks)
    } else {
        serde_json::to_string(&jwks)
    }
    .context("failed to encode key set")?;
    println!("{rendered}");
    Ok(())
}

pub async fn cmd_verify(args: VerifyArgs, config: &ControlConfig) -> Result<()> {
    let url = args.jwks_url.unwrap_or_else(|| config.jwks_url());
    let cache = JwksCache::new(Arc::new(HttpJwksSource::new(url.clone())), config.jwks_max_age());
    let verifier = Verifier::new(
        cache,
        args.clock_skew_ms.unwrap_or(config.clock_skew_ms),
    );
    let verified = verifier
        .verify(args.jws.trim())
        .await
        .with_context(|| format!("envelope rejected (keys from {url})"))?;
    let report = json!({
        "ok": true,
        "kid": verified.header.kid,
        "encoding": verified.encoding,
        "expiresAt": verified.payload.expires_at_ms(),
        "envelope": verified.payload,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode report")?
    );
    Ok(())
}
