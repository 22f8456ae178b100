use std::sync::Arc;

use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use soulbrowser_core_types::{now_ms, BusError};

use crate::der::p1363_to_der;
use crate::jwks::{JwksCache, VerificationKey};
use crate::model::{CommandEnvelope, JwsHeader, ALG_ES256};
use crate::{b64url_decode, crypto_error};

pub const DEFAULT_CLOCK_SKEW_MS: u64 = 60_000;

/// Wire form of an ECDSA signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    /// Fixed-width `r || s`, 32 bytes each.
    P1363,
    Der,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedEnvelope {
    pub header: JwsHeader,
    pub payload: CommandEnvelope,
    /// Which of the two attempts accepted the signature.
    pub encoding: SignatureEncoding,
}

/// Checks compact envelopes against a cached key set.
#[derive(Clone)]
pub struct Verifier {
    jwks: Arc<JwksCache>,
    clock_skew_ms: u64,
}

impl Verifier {
    pub fn new(jwks: Arc<JwksCache>, clock_skew_ms: u64) -> Self {
        Self {
            jwks,
            clock_skew_ms,
        }
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    pub async fn verify(&self, jws: &str) -> Result<VerifiedEnvelope, BusError> {
        self.verify_at(jws, now_ms()).await
    }

    pub async fn verify_at(&self, jws: &str, now_ms: i64) -> Result<VerifiedEnvelope, BusError> {
        let segments: Vec<&str> = jws.trim().split('.').collect();
        let [header_b64, payload_b64, signature_b64] = segments[..] else {
            return Err(BusError::Malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        };

        let header: JwsHeader = serde_json::from_slice(&b64url_decode(header_b64)?)
            .map_err(|err| BusError::Malformed(format!("header: {err}")))?;
        if header.alg != ALG_ES256 {
            return Err(BusError::UnsupportedAlg(header.alg));
        }
        let kid = header.kid.clone().ok_or(BusError::MissingKid)?;

        let payload: CommandEnvelope = serde_json::from_slice(&b64url_decode(payload_b64)?)
            .map_err(|err| BusError::Malformed(format!("payload: {err}")))?;
        let expired_at_ms = payload
            .expires_at_ms()
            .saturating_add(i64::try_from(self.clock_skew_ms).unwrap_or(i64::MAX));
        if now_ms > expired_at_ms {
            return Err(BusError::Expired { expired_at_ms });
        }

        let key = self.jwks.key_for(&kid).await?;
        let signature = b64url_decode(signature_b64)?;
        let signing_input = &jws.trim()[..header_b64.len() + 1 + payload_b64.len()];
        let encoding = verify_signature(&key, signing_input.as_bytes(), &signature)?;
        debug!(
            target: "envelope",
            command_id = %payload.command_id,
            %kid,
            ?encoding,
            "envelope verified"
        );
        Ok(VerifiedEnvelope {
            header,
            payload,
            encoding,
        })
    }
}

/// First try the bytes as fixed-width `r || s`; if that does not verify, try DER, either
/// re-encoded from the same two integers or taken as-is when the bytes are not 64 long.
pub(crate) fn verify_signature(
    key: &VerificationKey,
    signing_input: &[u8],
    signature: &[u8],
) -> Result<SignatureEncoding, BusError> {
    if signature.len() == 64 {
        let digest = Sha256::digest(signing_input);
        let (r, s) = signature.split_at(32);
        let raw_ok = BigNum::from_slice(r)
            .and_then(|r| BigNum::from_slice(s).map(|s| (r, s)))
            .and_then(|(r, s)| EcdsaSig::from_private_components(r, s))
            .and_then(|sig| sig.verify(&digest, &key.ec))
            .unwrap_or(false);
        if raw_ok {
            return Ok(SignatureEncoding::P1363);
        }
        debug!(target: "envelope", "raw signature rejected, retrying as DER");
    }

    let der = if signature.len() == 64 {
        p1363_to_der(signature)?
    } else {
        signature.to_vec()
    };
    let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha256(), &key.pkey)
        .map_err(crypto_error)?;
    verifier.update(signing_input).map_err(crypto_error)?;
    match verifier.verify(&der) {
        Ok(true) => Ok(SignatureEncoding::Der),
        _ => Err(BusError::InvalidSignature),
    }
}
