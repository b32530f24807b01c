//! Token domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authentication method reference used when the caller supplies none.
pub const DEFAULT_AMR: &str = "pwd";

/// Refresh token record stored in the database. The raw token is never
/// stored; `token_hash` is its hex SHA-256.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub token_hash: String,
    pub client_id: String,
    pub user_id: i64,
    pub tenant_id: Uuid,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub amr: Vec<String>,
    pub auth_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn subject(&self) -> String {
        self.user_id.to_string()
    }
}

/// Claims embedded in RS256 access tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer URL.
    pub iss: String,
    /// Subject (user ID).
    pub sub: String,
    /// Audience, normally the client ID first.
    pub aud: Vec<String>,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Space-delimited granted scopes.
    pub scope: String,
    /// Client the token was issued to.
    pub client_id: String,
    /// Token ID, the key of the revocation denylist.
    pub jti: String,
}

impl AccessTokenClaims {
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}
