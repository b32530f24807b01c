//! Access-token signing and refresh-token storage.
//!
//! Access tokens are RS256 JWTs signed with the newest active key. Refresh
//! tokens are opaque; only the hex SHA-256 of the raw value is persisted, and
//! raw values never reach the logs.

pub mod access;
pub mod queries;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::claims::{UserDirectory, parse_user_id};
use crate::error::{IdpError, OpContext, Result};
use crate::keys::KeyManager;
use crate::models::client::Client;
use crate::models::token::{AccessTokenClaims, DEFAULT_AMR, RefreshToken};

/// Default access-token lifetime (1 hour).
pub const DEFAULT_ACCESS_TOKEN_LIFETIME_SECS: i64 = 3_600;
/// Default refresh-token lifetime (30 days).
pub const DEFAULT_REFRESH_TOKEN_LIFETIME_SECS: i64 = 2_592_000;

/// Length of generated refresh tokens.
const REFRESH_TOKEN_LEN: usize = 64;

// =============================================================================
// Request and result types
// =============================================================================

/// How the end user authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Defaults to issuance time when unknown.
    pub auth_time: Option<DateTime<Utc>>,
    /// Authentication method references; `["pwd"]` when empty.
    pub amr: Vec<String>,
}

impl AuthContext {
    pub fn new(auth_time: DateTime<Utc>, amr: Vec<String>) -> Self {
        Self {
            auth_time: Some(auth_time),
            amr,
        }
    }

    fn resolve(&self, now: DateTime<Utc>) -> (DateTime<Utc>, Vec<String>) {
        let auth_time = self.auth_time.unwrap_or(now);
        let amr = if self.amr.is_empty() {
            vec![DEFAULT_AMR.to_string()]
        } else {
            self.amr.clone()
        };
        (auth_time, amr)
    }
}

/// Everything needed to mint tokens for one grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// The user ID as a decimal string.
    pub subject: String,
    pub client_id: String,
    pub audience: Vec<String>,
    pub scopes: Vec<String>,
    pub auth: AuthContext,
}

impl TokenRequest {
    /// Request whose audience is just the client.
    pub fn new(subject: impl Into<String>, client_id: impl Into<String>, scopes: Vec<String>) -> Self {
        let client_id = client_id.into();
        Self {
            subject: subject.into(),
            audience: vec![client_id.clone()],
            client_id,
            scopes,
            auth: AuthContext::default(),
        }
    }

    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.audience = audience;
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    /// The owning client: explicit, else the first audience entry.
    pub fn owning_client(&self) -> Result<&str> {
        if !self.client_id.is_empty() {
            return Ok(self.client_id.as_str());
        }
        self.audience
            .first()
            .map(String::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| IdpError::Validation("token request has no client".into()))
    }
}

/// Per-client overrides of the issuer's default lifetimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub access: Option<Duration>,
    pub refresh: Option<Duration>,
}

impl TokenLifetimes {
    pub fn from_client(client: &Client) -> Self {
        Self {
            access: Some(client.access_token_lifetime),
            refresh: Some(client.refresh_token_lifetime),
        }
    }
}

/// A signed access token.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// An access token plus the stored refresh-token record.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access: IssuedAccessToken,
    pub refresh: RefreshToken,
}

/// Row counts removed by [`delete_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSweep {
    pub refresh_tokens: u64,
    pub revoked_access_tokens: u64,
}

/// Issuer URL and default lifetimes.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub access_token_lifetime: Duration,
    pub refresh_token_lifetime: Duration,
}

impl TokenConfig {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            access_token_lifetime: Duration::seconds(DEFAULT_ACCESS_TOKEN_LIFETIME_SECS),
            refresh_token_lifetime: Duration::seconds(DEFAULT_REFRESH_TOKEN_LIFETIME_SECS),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Hex SHA-256 of a raw refresh token; the storage key.
pub fn hash_refresh_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a random opaque refresh token.
pub fn generate_refresh_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(REFRESH_TOKEN_LEN)
        .map(char::from)
        .collect()
}

// =============================================================================
// TokenIssuer
// =============================================================================

#[derive(Clone)]
pub struct TokenIssuer {
    keys: KeyManager,
    users: Arc<dyn UserDirectory>,
    config: TokenConfig,
}

impl TokenIssuer {
    pub fn new(keys: KeyManager, users: Arc<dyn UserDirectory>, config: TokenConfig) -> Self {
        Self {
            keys,
            users,
            config,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Sign an access token. `lifetime` overrides the issuer default.
    pub async fn issue_access_token(
        &self,
        conn: &mut PgConnection,
        req: &TokenRequest,
        lifetime: Option<Duration>,
    ) -> Result<IssuedAccessToken> {
        const OP: &str = "TokenIssuer.issue_access_token";

        let key = self.keys.active_signing_key(conn).await.op(OP)?;
        let now = Utc::now();
        let lifetime = lifetime.unwrap_or(self.config.access_token_lifetime);
        let jti = Uuid::new_v4().to_string();

        let claims = access::build_claims(&self.config.issuer, req, now, lifetime, jti.clone());
        let token = access::sign(&claims, &key).op(OP)?;

        debug!(key_id = %key.key_id, client_id = %req.client_id, %jti, "issued access token");
        Ok(IssuedAccessToken {
            token,
            jti,
            expires_at: now + lifetime,
        })
    }

    /// Sign an access token and store the hash of `raw_refresh`.
    pub async fn issue_access_and_refresh_tokens(
        &self,
        conn: &mut PgConnection,
        req: &TokenRequest,
        raw_refresh: &str,
        lifetimes: TokenLifetimes,
    ) -> Result<IssuedTokens> {
        const OP: &str = "TokenIssuer.issue_access_and_refresh_tokens";

        if raw_refresh.is_empty() {
            return Err(IdpError::Validation("empty refresh token".into())).op(OP);
        }
        let client_id = req.owning_client().op(OP)?.to_string();
        let user_id = parse_user_id(&req.subject).op(OP)?;
        let user = self.users.user_by_id(user_id).await.op(OP)?;

        let access = self
            .issue_access_token(conn, req, lifetimes.access)
            .await
            .op(OP)?;

        let now = Utc::now();
        let (auth_time, amr) = req.auth.resolve(now);
        let token_hash = hash_refresh_token(raw_refresh);
        let refresh_lifetime = lifetimes
            .refresh
            .unwrap_or(self.config.refresh_token_lifetime);

        let refresh = queries::insert_refresh(
            conn,
            &queries::NewRefreshToken {
                id: crate::uuid::uuidv7(),
                token_hash: &token_hash,
                client_id: &client_id,
                user_id,
                tenant_id: user.tenant_id,
                scopes: &req.scopes,
                audience: &req.audience,
                amr: &amr,
                auth_time,
                expires_at: now + refresh_lifetime,
            },
        )
        .await
        .op(OP)?;

        debug!(refresh_token_id = %refresh.id, %client_id, "stored refresh token");
        Ok(IssuedTokens { access, refresh })
    }

    /// Resolve a raw refresh token to its stored record.
    pub async fn lookup_by_raw_token(
        &self,
        conn: &mut PgConnection,
        raw: &str,
    ) -> Result<RefreshToken> {
        const OP: &str = "TokenIssuer.lookup_by_raw_token";

        let token = queries::find_refresh_by_hash(conn, &hash_refresh_token(raw))
            .await
            .op(OP)?
            .ok_or_else(|| IdpError::NotFound("refresh token".into()))
            .op(OP)?;
        if token.is_expired(Utc::now()) {
            return Err(IdpError::Expired("refresh token".into())).op(OP);
        }
        Ok(token)
    }

    /// Revoke a refresh token on behalf of its owning client. A mismatched
    /// client gets `PermissionDenied` and the token survives.
    pub async fn revoke_refresh_token(
        &self,
        conn: &mut PgConnection,
        raw: &str,
        client_id: &str,
    ) -> Result<()> {
        const OP: &str = "TokenIssuer.revoke_refresh_token";

        let token_hash = hash_refresh_token(raw);
        if queries::delete_refresh_for_client(conn, &token_hash, client_id)
            .await
            .op(OP)?
            > 0
        {
            debug!(%client_id, "revoked refresh token");
            return Ok(());
        }

        match queries::find_refresh_by_hash(conn, &token_hash).await.op(OP)? {
            None => Err(IdpError::NotFound("refresh token".into())).op(OP),
            Some(_) => Err(IdpError::PermissionDenied("client ID mismatch".into())).op(OP),
        }
    }

    /// Consume a refresh token being exchanged for a successor. Only the
    /// owning client can consume it, and only before it expires; otherwise
    /// the token is left in place.
    pub async fn consume_refresh_token(
        &self,
        conn: &mut PgConnection,
        raw: &str,
        client_id: &str,
    ) -> Result<RefreshToken> {
        const OP: &str = "TokenIssuer.consume_refresh_token";

        let token_hash = hash_refresh_token(raw);
        let now = Utc::now();
        if let Some(token) = queries::consume_refresh(conn, &token_hash, client_id, now)
            .await
            .op(OP)?
        {
            debug!(refresh_token_id = %token.id, %client_id, "consumed refresh token");
            return Ok(token);
        }

        match queries::find_refresh_by_hash(conn, &token_hash).await.op(OP)? {
            None => Err(IdpError::NotFound("refresh token".into())).op(OP),
            Some(token) if token.client_id != client_id => {
                Err(IdpError::PermissionDenied("client ID mismatch".into())).op(OP)
            }
            Some(_) => Err(IdpError::Expired("refresh token".into())).op(OP),
        }
    }

    /// Drop every refresh token of one user at one client.
    pub async fn terminate_session(
        &self,
        conn: &mut PgConnection,
        user_id: i64,
        client_id: &str,
    ) -> Result<u64> {
        let deleted = queries::delete_refresh_for_session(conn, user_id, client_id)
            .await
            .op("TokenIssuer.terminate_session")?;
        debug!(user_id, %client_id, deleted, "terminated session");
        Ok(deleted)
    }

    /// Denylist an access token until it would have expired anyway.
    pub async fn revoke_access_token(
        &self,
        conn: &mut PgConnection,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        const OP: &str = "TokenIssuer.revoke_access_token";

        if jti.is_empty() {
            return Err(IdpError::Validation("empty token ID".into())).op(OP);
        }
        queries::insert_revoked(conn, jti, expires_at).await.op(OP)?;
        debug!(%jti, %expires_at, "revoked access token");
        Ok(())
    }

    pub async fn is_access_token_revoked(&self, conn: &mut PgConnection, jti: &str) -> Result<bool> {
        queries::is_revoked(conn, jti, Utc::now())
            .await
            .op("TokenIssuer.is_access_token_revoked")
    }

    /// Full check of a presented access token: signature against the
    /// published keys, issuer, expiry and the denylist.
    pub async fn verify_access_token(
        &self,
        conn: &mut PgConnection,
        token: &str,
    ) -> Result<AccessTokenClaims> {
        const OP: &str = "TokenIssuer.verify_access_token";

        let key_set = self.keys.jwks(conn).await.op(OP)?;
        let claims = access::verify(token, &key_set, &self.config.issuer).op(OP)?;
        if self.is_access_token_revoked(conn, &claims.jti).await.op(OP)? {
            return Err(IdpError::PermissionDenied("access token revoked".into())).op(OP);
        }
        Ok(claims)
    }

    /// Sweep expired refresh tokens and denylist entries.
    pub async fn delete_expired(&self, conn: &mut PgConnection) -> Result<TokenSweep> {
        delete_expired(conn).await
    }
}

/// Sweep expired refresh tokens and denylist entries.
pub async fn delete_expired(conn: &mut PgConnection) -> Result<TokenSweep> {
    const OP: &str = "tokens.delete_expired";

    let now = Utc::now();
    let sweep = TokenSweep {
        refresh_tokens: queries::delete_expired_refresh(conn, now).await.op(OP)?,
        revoked_access_tokens: queries::delete_expired_revoked(conn, now).await.op(OP)?,
    };
    if sweep != TokenSweep::default() {
        debug!(
            refresh_tokens = sweep.refresh_tokens,
            revoked_access_tokens = sweep.revoked_access_tokens,
            "swept expired tokens"
        );
    }
    Ok(sweep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_hash_is_hex_sha256() {
        assert_eq!(
            hash_refresh_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_refresh_token("abc"), hash_refresh_token("abd"));
    }

    #[test]
    fn generated_refresh_tokens_are_unique() {
        let a = generate_refresh_token();
        assert_eq!(a.len(), REFRESH_TOKEN_LEN);
        assert_ne!(a, generate_refresh_token());
    }

    #[test]
    fn auth_context_defaults() {
        let now = Utc::now();
        let (auth_time, amr) = AuthContext::default().resolve(now);
        assert_eq!(auth_time, now);
        assert_eq!(amr, vec!["pwd"]);

        let earlier = now - Duration::minutes(3);
        let ctx = AuthContext::new(earlier, vec!["otp".into()]);
        assert_eq!(ctx.resolve(now), (earlier, vec!["otp".to_string()]));
    }

    #[test]
    fn client_falls_back_to_first_audience() {
        let req = TokenRequest::new("7", "", vec![]).with_audience(vec!["c2".into(), "api".into()]);
        assert_eq!(req.owning_client().unwrap(), "c2");

        let req = TokenRequest::new("7", "", vec![]).with_audience(vec![]);
        assert!(req.owning_client().is_err());
    }

    #[test]
    fn lifetimes_come_from_client() {
        let client = Client::new(
            "c1",
            "C1",
            crate::models::client::ApplicationType::Web,
            vec![],
        );
        let lifetimes = TokenLifetimes::from_client(&client);
        assert_eq!(lifetimes.access, Some(Duration::hours(1)));
        assert_eq!(lifetimes.refresh, Some(Duration::days(30)));
    }
}
