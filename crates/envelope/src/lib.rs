//! Signed command envelopes for the SoulBrowser control bus.
//!
//! Commands travel as compact ES256 JWS strings (`header.payload.signature`). The server signs
//! with a P-256 key and publishes the public half as a JWKS; agents verify against a cached copy
//! of that key set. Signature bytes are accepted in either fixed-width `r || s` form or DER.

mod der;
mod jwks;
mod key;
mod model;
mod verify;

pub use der::{der_to_p1363, p1363_to_der};
pub use jwks::{HttpJwksSource, JwksCache, JwksSource, StaticJwksSource, DEFAULT_JWKS_MAX_AGE};
pub use key::{Jwks, PublicJwk, SignedEnvelope, SigningKey};
pub use model::{CommandEnvelope, EnvelopeTarget, JwsHeader, ReplyTo, ALG_ES256, MIN_TTL_MS};
pub use verify::{SignatureEncoding, VerifiedEnvelope, Verifier, DEFAULT_CLOCK_SKEW_MS};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use soulbrowser_core_types::BusError;

pub(crate) fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn b64url_decode(segment: &str) -> Result<Vec<u8>, BusError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|err| BusError::Malformed(format!("bad base64url segment: {err}")))
}

pub(crate) fn crypto_error(err: openssl::error::ErrorStack) -> BusError {
    BusError::Internal(format!("crypto failure: {err}"))
}
