//! Agent-side acceptance of signed commands: verify, check audience, refuse replays.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use soulbrowser_core_types::{now_ms, CommandId};
use soulbrowser_envelope::{VerifiedEnvelope, Verifier};

use crate::errors::AgentError;

pub struct EnvelopeIntake {
    verifier: Verifier,
    audience: Option<String>,
    clock_skew_ms: u64,
    /// Accepted command ids and the instant after which the envelope could no longer verify.
    seen: DashMap<CommandId, i64>,
}

impl EnvelopeIntake {
    pub fn new(verifier: Verifier, clock_skew_ms: u64) -> Self {
        Self {
            verifier,
            audience: None,
            clock_skew_ms,
            seen: DashMap::new(),
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub async fn accept(&self, jws: &str) -> Result<VerifiedEnvelope, AgentError> {
        self.accept_at(jws, now_ms()).await
    }

    /// Each command id is accepted once; a second delivery fails `REPLAY` even though its
    /// signature is still valid.
    pub async fn accept_at(&self, jws: &str, now_ms: i64) -> Result<VerifiedEnvelope, AgentError> {
        let verified = self.verifier.verify_at(jws, now_ms).await?;
        let payload = &verified.payload;
        if let Some(expected) = &self.audience {
            if &payload.aud != expected {
                warn!(target: "envelope", command_id = %payload.command_id, aud = %payload.aud, "audience mismatch");
                return Err(AgentError::Audience {
                    expected: expected.clone(),
                    found: payload.aud.clone(),
                });
            }
        }

        let keep_until = payload
            .expires_at_ms()
            .saturating_add(i64::try_from(self.clock_skew_ms).unwrap_or(i64::MAX));
        match self.seen.entry(payload.command_id.clone()) {
            Entry::Occupied(_) => {
                warn!(target: "envelope", command_id = %payload.command_id, "replayed envelope refused");
                Err(AgentError::Replay {
                    command_id: payload.command_id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(keep_until);
                debug!(target: "envelope", command_id = %payload.command_id, "envelope accepted");
                Ok(verified)
            }
        }
    }

    /// Forget ids whose envelopes can no longer verify anyway. Returns how many were dropped.
    pub fn prune(&self, now_ms: i64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, keep_until| *keep_until >= now_ms);
        before.saturating_sub(self.seen.len())
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}
