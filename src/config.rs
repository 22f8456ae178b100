//! Control plane configuration: YAML file, then `SOUL_CONTROL_*` environment overrides, then
//! command-line flags.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use soulbrowser_envelope::MIN_TTL_MS;
use soulbrowser_registry::{HeartbeatConfig, TargetFallback};
use soulbrowser_scheduler::ActionTimeouts;

pub const JWKS_URL_ENV: &str = "SOUL_CONTROL_JWKS_URL";
pub const TTL_ENV: &str = "SOUL_CONTROL_TTL_MS";
pub const CLOCK_SKEW_ENV: &str = "SOUL_CONTROL_CLOCK_SKEW_MS";
pub const ACK_TIMEOUT_ENV: &str = "SOUL_CONTROL_ACK_TIMEOUT_MS";
pub const EXEC_TIMEOUT_ENV: &str = "SOUL_CONTROL_EXEC_TIMEOUT_MS";
pub const HEARTBEAT_INTERVAL_ENV: &str = "SOUL_CONTROL_HEARTBEAT_INTERVAL_MS";
pub const STALE_THRESHOLD_ENV: &str = "SOUL_CONTROL_STALE_THRESHOLD_MS";
pub const SIGNING_KEY_ENV: &str = "SOUL_CONTROL_SIGNING_KEY";
pub const TARGET_FALLBACK_ENV: &str = "SOUL_CONTROL_TARGET_FALLBACK";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Origin agents use to reach this server; derived from host and port when unset.
    pub public_origin: Option<String>,
    pub issuer: String,
    pub audience: String,
    /// PEM file holding the P-256 signing key. A fresh key is generated when unset.
    pub signing_key_path: Option<PathBuf>,
    /// Where agents (and the `verify` command) fetch the key set.
    pub jwks_url: Option<String>,
    pub command_ttl_ms: u64,
    pub clock_skew_ms: u64,
    pub ack_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub result_cache_ttl_ms: u64,
    pub jwks_max_age_ms: u64,
    pub target_fallback: TargetFallback,
    pub ledger_sweep_interval_ms: u64,
    /// How long a finished or expired command stays queryable after its expiry.
    pub ledger_retention_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8801,
            public_origin: None,
            issuer: "control-server".to_string(),
            audience: "browser-extension".to_string(),
            signing_key_path: None,
            jwks_url: None,
            command_ttl_ms: 30_000,
            clock_skew_ms: 60_000,
            ack_timeout_ms: 1_500,
            exec_timeout_ms: 60_000,
            heartbeat_interval_ms: 10_000,
            stale_threshold_ms: 90_000,
            result_cache_ttl_ms: 5 * 60_000,
            jwks_max_age_ms: 5 * 60_000,
            target_fallback: TargetFallback::FirstAvailable,
            ledger_sweep_interval_ms: 30_000,
            ledger_retention_ms: 5 * 60_000,
        }
    }
}

impl ControlConfig {
    /// Read `path`, or the per-user default location, falling back to defaults when absent.
    pub async fn load(path: Option<&PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path.clone(),
            None => {
                let mut path = dirs::config_dir().context("Failed to get config directory")?;
                path.push("soulbrowser");
                path.push("control.yaml");
                path
            }
        };

        if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: ControlConfig =
                serde_yaml::from_str(&content).context("Failed to parse config file")?;
            info!("Loaded configuration from: {}", path.display());
            Ok(config)
        } else {
            warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    /// Apply `SOUL_CONTROL_*` variables. Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(JWKS_URL_ENV) {
            if !url.trim().is_empty() {
                self.jwks_url = Some(url.trim().to_string());
            }
        }
        if let Ok(path) = env::var(SIGNING_KEY_ENV) {
            if !path.trim().is_empty() {
                self.signing_key_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(value) = env::var(TARGET_FALLBACK_ENV) {
            match value.parse() {
                Ok(fallback) => self.target_fallback = fallback,
                Err(err) => warn!(env = TARGET_FALLBACK_ENV, %err, "ignoring override"),
            }
        }
        env_ms(TTL_ENV, &mut self.command_ttl_ms);
        env_ms(CLOCK_SKEW_ENV, &mut self.clock_skew_ms);
        env_ms(ACK_TIMEOUT_ENV, &mut self.ack_timeout_ms);
        env_ms(EXEC_TIMEOUT_ENV, &mut self.exec_timeout_ms);
        env_ms(HEARTBEAT_INTERVAL_ENV, &mut self.heartbeat_interval_ms);
        env_ms(STALE_THRESHOLD_ENV, &mut self.stale_threshold_ms);
    }

    pub fn origin(&self) -> String {
        self.public_origin
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
            .trim_end_matches('/')
            .to_string()
    }

    pub fn default_reply_url(&self) -> String {
        format!("{}/control/callback", self.origin())
    }

    pub fn jwks_url(&self) -> String {
        self.jwks_url
            .clone()
            .unwrap_or_else(|| format!("{}/.well-known/jwks.json", self.origin()))
    }

    /// Requested TTL, or the default, never below the floor.
    pub fn ttl_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.command_ttl_ms)
            .max(MIN_TTL_MS)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            stale_threshold: Duration::from_millis(self.stale_threshold_ms),
        }
    }

    pub fn action_timeouts(&self) -> ActionTimeouts {
        ActionTimeouts {
            ack: Duration::from_millis(self.ack_timeout_ms),
            exec: Duration::from_millis(self.exec_timeout_ms),
        }
    }

    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.result_cache_ttl_ms)
    }

    pub fn jwks_max_age(&self) -> Duration {
        Duration::from_millis(self.jwks_max_age_ms)
    }
}

fn env_ms(name: &str, slot: &mut u64) {
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(env = name, value = %raw, "ignoring non-numeric override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_reference_values() {
        let config = ControlConfig::default();
        assert_eq!(config.ttl_ms(None), 30_000);
        assert_eq!(config.ttl_ms(Some(10)), 1_000);
        assert_eq!(config.action_timeouts().ack, Duration::from_millis(1_500));
        assert_eq!(config.heartbeat().timeout_threshold(), Duration::from_secs(180));
        assert_eq!(
            config.default_reply_url(),
            "http://127.0.0.1:8801/control/callback"
        );
        assert_eq!(
            config.jwks_url(),
            "http://127.0.0.1:8801/.well-known/jwks.json"
        );
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let config: ControlConfig = serde_yaml::from_str(
            "port: 9000\npublic_origin: https://control.example/\ntarget_fallback: strict\n",
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.target_fallback, TargetFallback::Strict);
        assert_eq!(config.origin(), "https://control.example");
        assert_eq!(config.exec_timeout_ms, 60_000);
    }

    #[test]
    #[serial]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        env::set_var(ACK_TIMEOUT_ENV, "2500");
        env::set_var(EXEC_TIMEOUT_ENV, "soon");
        env::set_var(JWKS_URL_ENV, "https://keys.example/jwks.json");
        let mut config = ControlConfig::default();
        config.apply_env_overrides();
        env::remove_var(ACK_TIMEOUT_ENV);
        env::remove_var(EXEC_TIMEOUT_ENV);
        env::remove_var(JWKS_URL_ENV);

        assert_eq!(config.ack_timeout_ms, 2_500);
        assert_eq!(config.exec_timeout_ms, 60_000);
        assert_eq!(config.jwks_url(), "https://keys.example/jwks.json");
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let config = ControlConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.port, 8801);
    }
}
