//! RS256 access-token signing and verification.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};

use crate::error::{IdpError, Result};
use crate::keys::{ActiveSigningKey, jwks};
use crate::models::key::JwkSet;
use crate::models::token::AccessTokenClaims;

use super::TokenRequest;

/// Build the claims for a new access token.
pub fn build_claims(
    issuer: &str,
    req: &TokenRequest,
    now: DateTime<Utc>,
    lifetime: Duration,
    jti: String,
) -> AccessTokenClaims {
    AccessTokenClaims {
        iss: issuer.to_string(),
        sub: req.subject.clone(),
        aud: req.audience.clone(),
        iat: now.timestamp(),
        exp: (now + lifetime).timestamp(),
        scope: req.scopes.join(" "),
        client_id: req.owning_client().unwrap_or_default().to_string(),
        jti,
    }
}

/// Sign claims with the active key, tagging the header with its key ID.
pub fn sign(claims: &AccessTokenClaims, key: &ActiveSigningKey) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.key_id.clone());
    encode(&header, claims, &key.encoding_key()?)
        .map_err(|e| IdpError::Crypto(format!("JWT signing failed: {e}")))
}

/// Verify signature, issuer and expiry against a published key set.
pub fn verify(token: &str, key_set: &JwkSet, issuer: &str) -> Result<AccessTokenClaims> {
    let header =
        decode_header(token).map_err(|e| IdpError::Validation(format!("malformed JWT: {e}")))?;
    if header.alg != Algorithm::RS256 {
        return Err(IdpError::Validation(format!(
            "unsupported JWT algorithm {:?}",
            header.alg
        )));
    }
    let kid = header
        .kid
        .ok_or_else(|| IdpError::Validation("JWT header has no kid".into()))?;
    let jwk = key_set
        .find(&kid)
        .ok_or_else(|| IdpError::NotFound(format!("signing key {kid}")))?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    validation.validate_aud = false;

    decode::<AccessTokenClaims>(token, &jwks::decoding_key(jwk)?, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            JwtErrorKind::ExpiredSignature => IdpError::Expired("access token".into()),
            _ => IdpError::Validation(format!("invalid access token: {e}")),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testutil::test_signing_key;

    const ISSUER: &str = "https://idp.example";

    fn request() -> TokenRequest {
        TokenRequest::new("7", "c1", vec!["openid".into(), "email".into()])
    }

    fn key_set(key: &ActiveSigningKey) -> JwkSet {
        JwkSet {
            keys: vec![jwks::jwk(&key.key_id, &key.public_key())],
        }
    }

    #[test]
    fn claims_carry_request_fields() {
        let now = Utc::now();
        let claims = build_claims(ISSUER, &request(), now, Duration::hours(1), "jti-1".into());
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.aud, vec!["c1"]);
        assert_eq!(claims.scope, "openid email");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.client_id, "c1");
    }

    #[test]
    fn client_id_claim_falls_back_to_audience() {
        let mut req = request().with_audience(vec!["c2".into()]);
        req.client_id.clear();
        let claims = build_claims(ISSUER, &req, Utc::now(), Duration::hours(1), "jti-2".into());
        assert_eq!(claims.client_id, "c2");
    }

    #[test]
    fn signed_token_verifies() {
        let key = test_signing_key();
        let claims = build_claims(ISSUER, &request(), Utc::now(), Duration::hours(1), "j".into());
        let token = sign(&claims, &key).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some(key.key_id.as_str()));
        assert_eq!(verify(&token, &key_set(&key), ISSUER).unwrap(), claims);
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let key = test_signing_key();
        let claims = build_claims(ISSUER, &request(), Utc::now(), Duration::hours(1), "j".into());
        let token = sign(&claims, &key).unwrap();
        let err = verify(&token, &key_set(&key), "https://other.example").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn expired_token_is_expired() {
        let key = test_signing_key();
        let past = Utc::now() - Duration::hours(2);
        let claims = build_claims(ISSUER, &request(), past, Duration::hours(1), "j".into());
        let token = sign(&claims, &key).unwrap();
        let err = verify(&token, &key_set(&key), ISSUER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
    }

    #[test]
    fn unknown_kid_is_not_found() {
        let key = test_signing_key();
        let claims = build_claims(ISSUER, &request(), Utc::now(), Duration::hours(1), "j".into());
        let token = sign(&claims, &key).unwrap();
        let err = verify(&token, &JwkSet::default(), ISSUER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn garbage_is_validation_error() {
        let err = verify("not.a.jwt", &JwkSet::default(), ISSUER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
