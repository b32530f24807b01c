//! RSA public keys as JSON Web Keys.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::DecodingKey;
use rsa::RsaPublicKey;
use rsa::traits::PublicKeyParts;

use crate::IdpError;
use crate::models::key::{Jwk, JwkSet, PublicKeyWithId, RS256};

/// Build the JWK for one signing key.
pub fn jwk(key_id: &str, public_key: &RsaPublicKey) -> Jwk {
    Jwk {
        kty: "RSA".into(),
        key_use: "sig".into(),
        alg: RS256.into(),
        kid: key_id.to_string(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    }
}

/// Build a key set, preserving input order.
pub fn jwk_set(keys: &[PublicKeyWithId]) -> JwkSet {
    JwkSet {
        keys: keys.iter().map(|k| jwk(&k.key_id, &k.public_key)).collect(),
    }
}

/// Verification key for a published JWK.
pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, IdpError> {
    DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
        .map_err(|e| IdpError::Crypto(format!("invalid JWK {}: {e}", jwk.kid)))
}
