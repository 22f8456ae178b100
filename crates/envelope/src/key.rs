use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use soulbrowser_core_types::{now_ms, BusError};

use crate::model::{JwsHeader, ALG_ES256};
use crate::verify::SignatureEncoding;
use crate::{b64url_decode, b64url_encode, crypto_error};

/// Public half of a P-256 signing key in JWK form.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

impl PublicJwk {
    /// base64url(SHA-256) over the canonical `{crv,kty,x,y}` member set.
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        b64url_encode(&Sha256::digest(canonical.as_bytes()))
    }

    pub(crate) fn to_ec_key(&self) -> Result<EcKey<Public>, BusError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(BusError::UnsupportedAlg(format!("{}/{}", self.kty, self.crv)));
        }
        let group = p256()?;
        let x = BigNum::from_slice(&b64url_decode(&self.x)?).map_err(crypto_error)?;
        let y = BigNum::from_slice(&b64url_decode(&self.y)?).map_err(crypto_error)?;
        EcKey::from_public_key_affine_coordinates(&group, &x, &y).map_err(crypto_error)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<PublicJwk>,
}

impl Jwks {
    pub fn find(&self, kid: &str) -> Option<&PublicJwk> {
        self.keys
            .iter()
            .find(|key| key.kid.as_deref() == Some(kid))
    }
}

/// Output of [`SigningKey::sign`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub jws: String,
    pub signed_at: i64,
}

pub(crate) fn p256() -> Result<EcGroup, BusError> {
    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).map_err(crypto_error)
}

/// Server-held ES256 key.
pub struct SigningKey {
    key: EcKey<Private>,
    jwk: PublicJwk,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid())
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    pub fn generate() -> Result<Self, BusError> {
        let group = p256()?;
        let key = EcKey::generate(&group).map_err(crypto_error)?;
        Self::from_ec_key(key)
    }

    /// Load a PEM encoded P-256 private key (SEC1 or PKCS#8).
    pub fn from_pem(pem: &[u8]) -> Result<Self, BusError> {
        let key = match EcKey::private_key_from_pem(pem) {
            Ok(key) => key,
            Err(_) => PKey::private_key_from_pem(pem)
                .and_then(|pkey| pkey.ec_key())
                .map_err(|err| BusError::Malformed(format!("signing key: {err}")))?,
        };
        if key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
            return Err(BusError::UnsupportedAlg(
                "signing key is not on P-256".to_string(),
            ));
        }
        Self::from_ec_key(key)
    }

    fn from_ec_key(key: EcKey<Private>) -> Result<Self, BusError> {
        key.check_key().map_err(crypto_error)?;
        let mut ctx = BigNumContext::new().map_err(crypto_error)?;
        let mut x = BigNum::new().map_err(crypto_error)?;
        let mut y = BigNum::new().map_err(crypto_error)?;
        key.public_key()
            .affine_coordinates_gfp(key.group(), &mut x, &mut y, &mut ctx)
            .map_err(crypto_error)?;
        let mut jwk = PublicJwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: b64url_encode(&x.to_vec_padded(32).map_err(crypto_error)?),
            y: b64url_encode(&y.to_vec_padded(32).map_err(crypto_error)?),
            kid: None,
            alg: Some(ALG_ES256.to_string()),
            key_use: Some("sig".to_string()),
        };
        jwk.kid = Some(jwk.thumbprint());
        Ok(Self { key, jwk })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>, BusError> {
        self.key.private_key_to_pem().map_err(crypto_error)
    }

    pub fn kid(&self) -> &str {
        self.jwk.kid.as_deref().unwrap_or_default()
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.jwk
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }

    /// Produce a compact JWS over the JSON encoding of `payload`.
    pub fn sign<T: Serialize>(
        &self,
        payload: &T,
        encoding: SignatureEncoding,
    ) -> Result<SignedEnvelope, BusError> {
        let header = JwsHeader {
            alg: ALG_ES256.to_string(),
            kid: Some(self.kid().to_string()),
            typ: Some("JWT".to_string()),
        };
        let header_json = serde_json::to_vec(&header)
            .map_err(|err| BusError::Internal(err.to_string()))?;
        let payload_json = serde_json::to_vec(payload)
            .map_err(|err| BusError::Internal(err.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            b64url_encode(&header_json),
            b64url_encode(&payload_json)
        );
        let digest = Sha256::digest(signing_input.as_bytes());
        let sig = EcdsaSig::sign(&digest, &self.key).map_err(crypto_error)?;
        let signature = match encoding {
            SignatureEncoding::P1363 => {
                let mut raw = sig.r().to_vec_padded(32).map_err(crypto_error)?;
                raw.extend(sig.s().to_vec_padded(32).map_err(crypto_error)?);
                raw
            }
            SignatureEncoding::Der => sig.to_der().map_err(crypto_error)?,
        };
        debug!(target: "envelope", kid = self.kid(), ?encoding, "envelope signed");
        Ok(SignedEnvelope {
            jws: format!("{signing_input}.{}", b64url_encode(&signature)),
            signed_at: now_ms(),
        })
    }
}
