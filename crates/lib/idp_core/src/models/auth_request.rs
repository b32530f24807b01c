//! Authorization requests, one per authorization-code flow attempt.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// How long an authorization request stays usable after creation (5 minutes).
pub const AUTH_REQUEST_TTL_SECS: i64 = 300;

pub fn auth_request_ttl() -> Duration {
    Duration::seconds(AUTH_REQUEST_TTL_SECS)
}

/// Lifecycle state. `Expired` is not stored; it is derived from `expires_at`
/// at read time and takes precedence over every stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequestState {
    Created,
    Authenticated,
    Redeemed,
    Expired,
}

/// PKCE code challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "S256")]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "S256" => Some(CodeChallengeMethod::S256),
            "plain" => Some(CodeChallengeMethod::Plain),
            _ => None,
        }
    }
}

/// PKCE binding supplied at authorize time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChallenge {
    pub challenge: String,
    pub method: CodeChallengeMethod,
}

/// An authenticated end user, as attached to a request by the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authentication {
    pub user_id: i64,
    pub tenant_id: Uuid,
}

/// Input for creating an authorization request.
#[derive(Debug, Clone)]
pub struct NewAuthRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub response_type: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<CodeChallenge>,
    /// Set when the end user is already logged in at authorize time.
    pub authenticated: Option<Authentication>,
}

impl NewAuthRequest {
    pub fn new(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            response_type: response_type.into(),
            state: None,
            nonce: None,
            code_challenge: None,
            authenticated: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_code_challenge(
        mut self,
        challenge: impl Into<String>,
        method: CodeChallengeMethod,
    ) -> Self {
        self.code_challenge = Some(CodeChallenge {
            challenge: challenge.into(),
            method,
        });
        self
    }

    pub fn with_authentication(mut self, user_id: i64, tenant_id: Uuid) -> Self {
        self.authenticated = Some(Authentication { user_id, tenant_id });
        self
    }
}

/// Database row for `oidc_auth_requests`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthRequest {
    pub id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub response_type: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub code: Option<String>,
    pub code_used: bool,
    pub user_id: Option<i64>,
    pub tenant_id: Option<Uuid>,
    pub auth_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() && self.auth_time.is_some()
    }

    pub fn lifecycle(&self, now: DateTime<Utc>) -> AuthRequestState {
        if self.is_expired(now) {
            AuthRequestState::Expired
        } else if self.code_used {
            AuthRequestState::Redeemed
        } else if self.is_authenticated() {
            AuthRequestState::Authenticated
        } else {
            AuthRequestState::Created
        }
    }

    /// Subject of the authenticated user, empty until authentication.
    pub fn subject(&self) -> String {
        self.user_id.map(|id| id.to_string()).unwrap_or_default()
    }

    pub fn code_challenge(&self) -> Option<CodeChallenge> {
        let challenge = self.code_challenge.clone()?;
        let method = self
            .code_challenge_method
            .as_deref()
            .and_then(CodeChallengeMethod::parse)
            .unwrap_or(CodeChallengeMethod::Plain);
        Some(CodeChallenge { challenge, method })
    }

    /// Check a PKCE code verifier against the stored challenge. Requests
    /// without a challenge accept any verifier.
    pub fn verify_code_verifier(&self, verifier: &str) -> bool {
        let Some(CodeChallenge { challenge, method }) = self.code_challenge() else {
            return true;
        };
        let computed = match method {
            CodeChallengeMethod::Plain => verifier.to_string(),
            CodeChallengeMethod::S256 => compute_s256_challenge(verifier),
        };
        computed.as_bytes().ct_eq(challenge.as_bytes()).into()
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn compute_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}
