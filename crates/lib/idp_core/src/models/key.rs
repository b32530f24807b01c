//! Signing-key rows and the JSON Web Key shapes published from them.

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

/// The only signature algorithm this provider issues.
pub const RS256: &str = "RS256";

/// Database row for `oidc_signing_keys`.
#[derive(Clone, sqlx::FromRow)]
pub struct SigningKeyRow {
    pub key_id: String,
    pub algorithm: String,
    /// AES-256-GCM sealed PKCS#8 DER.
    pub private_key: Vec<u8>,
    /// SPKI DER.
    pub public_key: Vec<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub retire_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SigningKeyRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyRow")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("retire_at", &self.retire_at)
            .finish_non_exhaustive()
    }
}

/// A published public key with its database key ID.
#[derive(Debug, Clone)]
pub struct PublicKeyWithId {
    pub key_id: String,
    pub public_key: RsaPublicKey,
}

/// JSON Web Key (RFC 7517) for an RSA signature key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
}

/// JSON Web Key Set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}
