//! Values exchanged with the protocol engine.

use chrono::{DateTime, Utc};
use idp_core::models::auth_request::{CodeChallengeMethod, NewAuthRequest};
use idp_core::models::token::RefreshToken;
use idp_core::tokens::{AuthContext, TokenRequest};
use rsa::RsaPublicKey;

use crate::error::{OidcError, OidcResult};

/// The only signature algorithm the provider signs with.
pub const SIGNATURE_ALGORITHM: &str = "RS256";

/// An authorize request as parsed by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub response_type: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    /// `S256` or `plain`; `plain` when a challenge comes without a method.
    pub code_challenge_method: Option<String>,
}

impl AuthorizeRequest {
    pub(crate) fn to_new_auth_request(&self) -> OidcResult<NewAuthRequest> {
        let mut new = NewAuthRequest::new(
            &self.client_id,
            &self.redirect_uri,
            self.scopes.clone(),
            &self.response_type,
        );
        if let Some(state) = self.state.as_deref().filter(|s| !s.is_empty()) {
            new = new.with_state(state);
        }
        if let Some(nonce) = self.nonce.as_deref().filter(|n| !n.is_empty()) {
            new = new.with_nonce(nonce);
        }
        if let Some(challenge) = self.code_challenge.as_deref().filter(|c| !c.is_empty()) {
            let method = match self.code_challenge_method.as_deref() {
                None | Some("") => CodeChallengeMethod::Plain,
                Some(m) => CodeChallengeMethod::parse(m).ok_or_else(|| {
                    OidcError::invalid_request(format!("unsupported code_challenge_method {m:?}"))
                })?,
            };
            new = new.with_code_challenge(challenge, method);
        }
        Ok(new)
    }
}

/// Tokens minted for a grant. `refresh_token` is the raw value, handed out
/// once and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// The grant behind a presented refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRequest {
    pub subject: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub amr: Vec<String>,
    pub auth_time: DateTime<Utc>,
}

impl RefreshTokenRequest {
    /// Narrow the granted scopes, as the engine does when the client asks
    /// for a subset on refresh. Scopes never widen.
    pub fn set_current_scopes(&mut self, scopes: Vec<String>) {
        self.scopes.retain(|s| scopes.contains(s));
    }

    /// Request for the successor tokens, carrying the original
    /// authentication forward.
    pub fn to_token_request(&self) -> TokenRequest {
        TokenRequest::new(&self.subject, &self.client_id, self.scopes.clone())
            .with_audience(self.audience.clone())
            .with_auth(AuthContext::new(self.auth_time, self.amr.clone()))
    }
}

impl From<RefreshToken> for RefreshTokenRequest {
    fn from(token: RefreshToken) -> Self {
        Self {
            subject: token.subject(),
            client_id: token.client_id,
            scopes: token.scopes,
            audience: token.audience,
            amr: token.amr,
            auth_time: token.auth_time,
        }
    }
}

/// Owner and ID of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenInfo {
    pub user_id: String,
    pub token_id: String,
}

/// A published verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationKey {
    pub key_id: String,
    pub algorithm: &'static str,
    pub key_use: &'static str,
    pub public_key: RsaPublicKey,
}
