use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssl::ec::EcKey;
use openssl::pkey::{PKey, Public};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use soulbrowser_core_types::BusError;

use crate::key::Jwks;

pub const DEFAULT_JWKS_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Where a key set comes from.
#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<Jwks, BusError>;

    fn describe(&self) -> String;
}

pub struct HttpJwksSource {
    client: reqwest::Client,
    url: String,
}

impl HttpJwksSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<Jwks, BusError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| BusError::JwksUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BusError::JwksUnavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        response
            .json::<Jwks>()
            .await
            .map_err(|err| BusError::JwksUnavailable(err.to_string()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// In-process key set, swappable to simulate rotation.
#[derive(Default)]
pub struct StaticJwksSource {
    jwks: parking_lot::RwLock<Jwks>,
    fetches: AtomicUsize,
}

impl StaticJwksSource {
    pub fn new(jwks: Jwks) -> Self {
        Self {
            jwks: parking_lot::RwLock::new(jwks),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn replace(&self, jwks: Jwks) {
        *self.jwks.write() = jwks;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksSource for StaticJwksSource {
    async fn fetch(&self) -> Result<Jwks, BusError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.jwks.read().clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[derive(Clone)]
pub(crate) struct VerificationKey {
    pub ec: EcKey<Public>,
    pub pkey: PKey<Public>,
}

struct CachedJwks {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

/// Process-wide cache over one key set source.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    max_age: Duration,
    entry: RwLock<Option<CachedJwks>>,
    refresh_gate: Mutex<()>,
    generation: AtomicU64,
}

impl JwksCache {
    pub fn new(source: Arc<dyn JwksSource>, max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            max_age,
            entry: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn http(url: impl Into<String>) -> Arc<Self> {
        Self::new(Arc::new(HttpJwksSource::new(url)), DEFAULT_JWKS_MAX_AGE)
    }

    pub async fn is_stale(&self) -> bool {
        match self.entry.read().await.as_ref() {
            Some(cached) => cached.fetched_at.elapsed() > self.max_age,
            None => true,
        }
    }

    /// Refetch the key set. Concurrent callers coalesce onto one fetch.
    pub async fn refresh(&self) -> Result<usize, BusError> {
        let seen = self.generation.load(Ordering::SeqCst);
        let _gate = self.refresh_gate.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            if let Some(cached) = self.entry.read().await.as_ref() {
                return Ok(cached.keys.len());
            }
        }
        let jwks = self.source.fetch().await?;
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                continue;
            };
            match jwk.to_ec_key() {
                Ok(ec) => match PKey::from_ec_key(ec.clone()) {
                    Ok(pkey) => {
                        keys.insert(kid, VerificationKey { ec, pkey });
                    }
                    Err(err) => warn!(target: "envelope", %kid, ?err, "skipping unusable jwk"),
                },
                Err(err) => warn!(target: "envelope", %kid, ?err, "skipping unusable jwk"),
            }
        }
        let count = keys.len();
        *self.entry.write().await = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(target: "envelope", source = %self.source.describe(), keys = count, "jwks refreshed");
        Ok(count)
    }

    async fn lookup(&self, kid: &str) -> (Option<VerificationKey>, bool) {
        match self.entry.read().await.as_ref() {
            Some(cached) => (
                cached.keys.get(kid).cloned(),
                cached.fetched_at.elapsed() > self.max_age,
            ),
            None => (None, true),
        }
    }

    /// Resolve the verification key for `kid`: refresh when stale, and refetch once more on a
    /// miss before giving up with `UNKNOWN_KID`.
    pub(crate) async fn key_for(&self, kid: &str) -> Result<VerificationKey, BusError> {
        let (mut found, stale) = self.lookup(kid).await;
        let mut refreshed = false;
        if stale {
            match self.refresh().await {
                Ok(_) => {
                    refreshed = true;
                    found = self.lookup(kid).await.0;
                }
                Err(err) if found.is_some() => {
                    warn!(target: "envelope", ?err, %kid, "jwks refresh failed, serving stale key");
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(key) = found {
            return Ok(key);
        }
        if !refreshed {
            debug!(target: "envelope", %kid, "unknown kid, refetching key set");
            self.refresh().await?;
        }
        self.lookup(kid)
            .await
            .0
            .ok_or_else(|| BusError::UnknownKid(kid.to_string()))
    }

    /// Keep the cache warm until `shutdown` fires.
    pub fn spawn_refresh(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(cache.max_age);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cache.refresh().await {
                            warn!(target: "envelope", ?err, "background jwks refresh failed");
                        }
                    }
                }
            }
            debug!(target: "envelope", "jwks refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SigningKey;

    #[tokio::test(start_paused = true)]
    async fn stale_cache_is_refetched() {
        let key = SigningKey::generate().unwrap();
        let source = Arc::new(StaticJwksSource::new(key.jwks()));
        let cache = JwksCache::new(source.clone(), Duration::from_secs(300));

        cache.key_for(key.kid()).await.unwrap();
        cache.key_for(key.kid()).await.unwrap();
        assert_eq!(source.fetch_count(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.is_stale().await);
        cache.key_for(key.kid()).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kid_refetches_exactly_once() {
        let old = SigningKey::generate().unwrap();
        let rotated = SigningKey::generate().unwrap();
        let source = Arc::new(StaticJwksSource::new(old.jwks()));
        let cache = JwksCache::new(source.clone(), Duration::from_secs(300));
        cache.refresh().await.unwrap();

        source.replace(rotated.jwks());
        cache.key_for(rotated.kid()).await.unwrap();
        assert_eq!(source.fetch_count(), 2);

        let err = cache.key_for("nope").await.err().unwrap();
        assert_eq!(err, BusError::UnknownKid("nope".into()));
        assert_eq!(source.fetch_count(), 3);
    }
}
