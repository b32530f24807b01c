//! The engine's persistence contract and its Postgres implementation.
//!
//! `Storage` holds no request state. Every method that touches the database
//! runs on the connection the engine passes in, so the engine decides whether
//! a call is part of a larger transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use idp_core::auth_request::AuthRequests;
use idp_core::claims::{ClaimsResolver, Introspection, UserDirectory, UserInfo, parse_user_id};
use idp_core::config::IdpConfig;
use idp_core::keys::{ActiveSigningKey, KeyManager};
use idp_core::models::auth_request::AuthRequest;
use idp_core::models::client::Client;
use idp_core::models::key::JwkSet;
use idp_core::tokens::{
    IssuedAccessToken, TokenIssuer, TokenLifetimes, TokenRequest, generate_refresh_token,
};
use idp_core::{ErrorKind, IdpError, clients, db};
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, OidcError, OidcResult};
use crate::types::{
    AuthorizeRequest, RefreshTokenInfo, RefreshTokenRequest, SIGNATURE_ALGORITHM, TokenPair,
    VerificationKey,
};

/// Persistence operations the protocol engine calls.
#[async_trait]
pub trait OpStorage: Send + Sync {
    // -- Clients --------------------------------------------------------------

    async fn get_client_by_client_id(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
    ) -> OidcResult<Client>;

    /// Public clients pass with any secret.
    async fn authorize_client_id_secret(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
        client_secret: &str,
    ) -> OidcResult<()>;

    // -- Authorization requests -----------------------------------------------

    /// Store a new authorization request. `user_id` is set when the end user
    /// is already logged in.
    async fn create_auth_request(
        &self,
        conn: &mut PgConnection,
        request: &AuthorizeRequest,
        user_id: Option<&str>,
    ) -> OidcResult<AuthRequest>;

    async fn auth_request_by_id(&self, conn: &mut PgConnection, id: &str) -> OidcResult<AuthRequest>;

    /// Redeem an authorization code. Succeeds once per code.
    async fn auth_request_by_code(
        &self,
        conn: &mut PgConnection,
        code: &str,
    ) -> OidcResult<AuthRequest>;

    async fn save_auth_code(&self, conn: &mut PgConnection, id: &str, code: &str) -> OidcResult<()>;

    /// Called by the login UI once the end user has authenticated.
    async fn complete_auth_request(
        &self,
        conn: &mut PgConnection,
        id: &str,
        user_id: &str,
    ) -> OidcResult<AuthRequest>;

    async fn delete_auth_request(&self, conn: &mut PgConnection, id: &str) -> OidcResult<()>;

    // -- Tokens ---------------------------------------------------------------

    async fn create_access_token(
        &self,
        conn: &mut PgConnection,
        request: &TokenRequest,
    ) -> OidcResult<IssuedAccessToken>;

    /// Mint an access token and a fresh refresh token. When
    /// `current_refresh_token` is given it is consumed, so each refresh
    /// token can be exchanged only once, by its own client, before it
    /// expires.
    async fn create_access_and_refresh_tokens(
        &self,
        conn: &mut PgConnection,
        request: &TokenRequest,
        current_refresh_token: Option<&str>,
    ) -> OidcResult<TokenPair>;

    async fn token_request_by_refresh_token(
        &self,
        conn: &mut PgConnection,
        refresh_token: &str,
    ) -> OidcResult<RefreshTokenRequest>;

    async fn get_refresh_token_info(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
        refresh_token: &str,
    ) -> OidcResult<RefreshTokenInfo>;

    /// With a `user_id`, `token_or_token_id` is an access-token ID to
    /// denylist; without one it is a raw refresh token to delete.
    async fn revoke_token(
        &self,
        conn: &mut PgConnection,
        token_or_token_id: &str,
        user_id: &str,
        client_id: &str,
    ) -> OidcResult<()>;

    async fn terminate_session(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        client_id: &str,
    ) -> OidcResult<()>;

    // -- Keys -----------------------------------------------------------------

    async fn signing_key(&self, conn: &mut PgConnection) -> OidcResult<ActiveSigningKey>;

    fn signature_algorithms(&self) -> Vec<&'static str>;

    async fn key_set(&self, conn: &mut PgConnection) -> OidcResult<Vec<VerificationKey>>;

    async fn get_key_set(&self, conn: &mut PgConnection) -> OidcResult<JwkSet>;

    /// Rotate: a new key signs from now on, older keys stay published until
    /// their grace period ends. Returns the new key ID.
    async fn save_new_key_pair(&self) -> OidcResult<String>;

    // -- Claims ---------------------------------------------------------------

    async fn set_userinfo_from_scopes(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
    ) -> OidcResult<UserInfo>;

    async fn set_userinfo_from_token(
        &self,
        token_id: &str,
        subject: &str,
        origin: &str,
    ) -> OidcResult<UserInfo>;

    /// Inactive if the token has been revoked.
    async fn set_introspection_from_token(
        &self,
        conn: &mut PgConnection,
        token_id: &str,
        subject: &str,
        client_id: &str,
    ) -> OidcResult<Introspection>;

    async fn get_private_claims_from_scopes(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
    ) -> OidcResult<Map<String, Value>>;

    async fn health(&self, conn: &mut PgConnection) -> OidcResult<()>;
}

fn parse_request_id(op: &'static str, id: &str) -> OidcResult<Uuid> {
    idp_core::uuid::parse("auth request ID", id).map_err(|e| OidcError::from_core(op, e))
}

fn parse_subject(op: &'static str, user_id: &str) -> OidcResult<i64> {
    parse_user_id(user_id).map_err(|e| OidcError::from_core(op, e))
}

/// [`OpStorage`] over the idp_core components.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    keys: KeyManager,
    auth_requests: AuthRequests,
    tokens: TokenIssuer,
    claims: ClaimsResolver,
}

impl Storage {
    pub fn new(
        pool: PgPool,
        keys: KeyManager,
        auth_requests: AuthRequests,
        tokens: TokenIssuer,
        claims: ClaimsResolver,
    ) -> Self {
        Self {
            pool,
            keys,
            auth_requests,
            tokens,
            claims,
        }
    }

    /// Wire every component from one config and user directory.
    pub fn from_config(pool: PgPool, config: &IdpConfig, users: Arc<dyn UserDirectory>) -> Self {
        let keys = KeyManager::new(&config.crypto_key).with_rotation_grace(config.key_rotation_grace);
        Self::new(
            pool,
            keys.clone(),
            AuthRequests::new(),
            TokenIssuer::new(keys, users.clone(), config.token_config()),
            ClaimsResolver::new(users),
        )
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    async fn tenant_of(&self, op: &'static str, user_id: i64) -> OidcResult<Uuid> {
        self.claims
            .users()
            .user_by_id(user_id)
            .await
            .map(|user| user.tenant_id)
            .map_err(|e| OidcError::from_core(op, e))
    }

    /// Lifetimes configured on the token's client.
    async fn client_lifetimes(
        &self,
        op: &'static str,
        conn: &mut PgConnection,
        client_id: &str,
    ) -> OidcResult<TokenLifetimes> {
        clients::get_by_client_id(conn, client_id)
            .await
            .map(|client| TokenLifetimes::from_client(&client))
            .map_err(|e| OidcError::from_client_lookup(op, e))
    }
}

#[async_trait]
impl OpStorage for Storage {
    async fn get_client_by_client_id(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
    ) -> OidcResult<Client> {
        clients::get_by_client_id(conn, client_id)
            .await
            .map_err(|e| OidcError::from_client_lookup("Storage.get_client_by_client_id", e))
    }

    async fn authorize_client_id_secret(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
        client_secret: &str,
    ) -> OidcResult<()> {
        clients::authorize_secret(conn, client_id, client_secret)
            .await
            .map(|_| ())
            .map_err(|e| OidcError::from_client_lookup("Storage.authorize_client_id_secret", e))
    }

    async fn create_auth_request(
        &self,
        conn: &mut PgConnection,
        request: &AuthorizeRequest,
        user_id: Option<&str>,
    ) -> OidcResult<AuthRequest> {
        const OP: &str = "Storage.create_auth_request";

        let mut new = request.to_new_auth_request()?;
        if let Some(user_id) = user_id.filter(|u| !u.is_empty()) {
            let user_id = parse_subject(OP, user_id)?;
            let tenant_id = self.tenant_of(OP, user_id).await?;
            new = new.with_authentication(user_id, tenant_id);
        }

        self.auth_requests
            .create(conn, new)
            .await
            .map_err(|e| match e.kind() {
                // An unknown or disabled client is a client problem here.
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    OidcError::with_code(OP, ErrorCode::UnauthorizedClient, e)
                }
                _ => OidcError::from_core(OP, e),
            })
    }

    async fn auth_request_by_id(&self, conn: &mut PgConnection, id: &str) -> OidcResult<AuthRequest> {
        const OP: &str = "Storage.auth_request_by_id";

        let id = parse_request_id(OP, id)?;
        self.auth_requests
            .get_by_id(conn, id)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn auth_request_by_code(
        &self,
        conn: &mut PgConnection,
        code: &str,
    ) -> OidcResult<AuthRequest> {
        self.auth_requests
            .redeem_by_code(conn, code)
            .await
            .map_err(|e| OidcError::from_core("Storage.auth_request_by_code", e))
    }

    async fn save_auth_code(&self, conn: &mut PgConnection, id: &str, code: &str) -> OidcResult<()> {
        const OP: &str = "Storage.save_auth_code";

        let id = parse_request_id(OP, id)?;
        self.auth_requests
            .save_code(conn, id, code)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn complete_auth_request(
        &self,
        conn: &mut PgConnection,
        id: &str,
        user_id: &str,
    ) -> OidcResult<AuthRequest> {
        const OP: &str = "Storage.complete_auth_request";

        let id = parse_request_id(OP, id)?;
        let user_id = parse_subject(OP, user_id)?;
        let tenant_id = self.tenant_of(OP, user_id).await?;
        self.auth_requests
            .complete_authentication(conn, id, user_id, tenant_id)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn delete_auth_request(&self, conn: &mut PgConnection, id: &str) -> OidcResult<()> {
        const OP: &str = "Storage.delete_auth_request";

        let id = parse_request_id(OP, id)?;
        self.auth_requests
            .delete(conn, id)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn create_access_token(
        &self,
        conn: &mut PgConnection,
        request: &TokenRequest,
    ) -> OidcResult<IssuedAccessToken> {
        const OP: &str = "Storage.create_access_token";

        let client_id = owning_client(OP, request)?;
        let lifetimes = self.client_lifetimes(OP, conn, client_id).await?;
        self.tokens
            .issue_access_token(conn, request, lifetimes.access)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn create_access_and_refresh_tokens(
        &self,
        conn: &mut PgConnection,
        request: &TokenRequest,
        current_refresh_token: Option<&str>,
    ) -> OidcResult<TokenPair> {
        const OP: &str = "Storage.create_access_and_refresh_tokens";

        let client_id = owning_client(OP, request)?;
        if let Some(current) = current_refresh_token {
            self.tokens
                .consume_refresh_token(conn, current, client_id)
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound | ErrorKind::Expired | ErrorKind::PermissionDenied => {
                        OidcError::with_code(OP, ErrorCode::InvalidGrant, invalid_refresh_token(e))
                    }
                    _ => OidcError::from_core(OP, e),
                })?;
        }

        let lifetimes = self.client_lifetimes(OP, conn, client_id).await?;
        let raw = generate_refresh_token();
        let issued = self
            .tokens
            .issue_access_and_refresh_tokens(conn, request, &raw, lifetimes)
            .await
            .map_err(|e| OidcError::from_core(OP, e))?;

        Ok(TokenPair {
            access_token: issued.access.token,
            refresh_token: raw,
            expires_at: issued.access.expires_at,
        })
    }

    async fn token_request_by_refresh_token(
        &self,
        conn: &mut PgConnection,
        refresh_token: &str,
    ) -> OidcResult<RefreshTokenRequest> {
        self.tokens
            .lookup_by_raw_token(conn, refresh_token)
            .await
            .map(RefreshTokenRequest::from)
            .map_err(|e| OidcError::from_core("Storage.token_request_by_refresh_token", e))
    }

    async fn get_refresh_token_info(
        &self,
        conn: &mut PgConnection,
        client_id: &str,
        refresh_token: &str,
    ) -> OidcResult<RefreshTokenInfo> {
        const OP: &str = "Storage.get_refresh_token_info";

        let token = self
            .tokens
            .lookup_by_raw_token(conn, refresh_token)
            .await
            .map_err(|e| OidcError::from_core(OP, e))?;
        if token.client_id != client_id {
            debug!(%client_id, "refresh token belongs to another client");
            return Err(OidcError::invalid_grant("client ID mismatch"));
        }
        Ok(RefreshTokenInfo {
            user_id: token.subject(),
            token_id: token.id.to_string(),
        })
    }

    async fn revoke_token(
        &self,
        conn: &mut PgConnection,
        token_or_token_id: &str,
        user_id: &str,
        client_id: &str,
    ) -> OidcResult<()> {
        const OP: &str = "Storage.revoke_token";

        if !user_id.is_empty() {
            // The token is already short-lived; it only has to stay on the
            // denylist for as long as it could still verify.
            let access_lifetime = match self.client_lifetimes(OP, conn, client_id).await {
                Ok(lifetimes) => lifetimes.access,
                Err(e) if e.code == ErrorCode::InvalidClient => None,
                Err(e) => return Err(e),
            }
            .unwrap_or(self.tokens.config().access_token_lifetime);

            return self
                .tokens
                .revoke_access_token(conn, token_or_token_id, Utc::now() + access_lifetime)
                .await
                .map_err(|e| OidcError::from_core(OP, e));
        }

        self.tokens
            .revoke_refresh_token(conn, token_or_token_id, client_id)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::Expired => {
                    OidcError::with_code(OP, ErrorCode::InvalidGrant, invalid_refresh_token(e))
                }
                ErrorKind::PermissionDenied => OidcError::with_code(OP, ErrorCode::InvalidGrant, e),
                _ => OidcError::from_core(OP, e),
            })
    }

    async fn terminate_session(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        client_id: &str,
    ) -> OidcResult<()> {
        const OP: &str = "Storage.terminate_session";

        let user_id = parse_subject(OP, user_id)?;
        self.tokens
            .terminate_session(conn, user_id, client_id)
            .await
            .map(|_| ())
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn signing_key(&self, conn: &mut PgConnection) -> OidcResult<ActiveSigningKey> {
        self.keys
            .active_signing_key(conn)
            .await
            .map_err(|e| OidcError::with_code("Storage.signing_key", ErrorCode::ServerError, e))
    }

    fn signature_algorithms(&self) -> Vec<&'static str> {
        vec![SIGNATURE_ALGORITHM]
    }

    async fn key_set(&self, conn: &mut PgConnection) -> OidcResult<Vec<VerificationKey>> {
        let keys = self
            .keys
            .public_keys_with_ids(conn)
            .await
            .map_err(|e| OidcError::from_core("Storage.key_set", e))?;
        Ok(keys
            .into_iter()
            .map(|k| VerificationKey {
                key_id: k.key_id,
                algorithm: SIGNATURE_ALGORITHM,
                key_use: "sig",
                public_key: k.public_key,
            })
            .collect())
    }

    async fn get_key_set(&self, conn: &mut PgConnection) -> OidcResult<JwkSet> {
        self.keys
            .jwks(conn)
            .await
            .map_err(|e| OidcError::from_core("Storage.get_key_set", e))
    }

    async fn save_new_key_pair(&self) -> OidcResult<String> {
        let key_id = self
            .keys
            .rotate(&self.pool)
            .await
            .map_err(|e| OidcError::from_core("Storage.save_new_key_pair", e))?;
        info!(%key_id, "rotated signing key");
        Ok(key_id)
    }

    async fn set_userinfo_from_scopes(
        &self,
        user_id: &str,
        _client_id: &str,
        scopes: &[String],
    ) -> OidcResult<UserInfo> {
        const OP: &str = "Storage.set_userinfo_from_scopes";

        let user_id = parse_subject(OP, user_id)?;
        self.claims
            .userinfo_from_scopes(user_id, scopes)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn set_userinfo_from_token(
        &self,
        _token_id: &str,
        subject: &str,
        _origin: &str,
    ) -> OidcResult<UserInfo> {
        self.claims
            .userinfo_for_subject(subject)
            .await
            .map_err(|e| OidcError::from_core("Storage.set_userinfo_from_token", e))
    }

    async fn set_introspection_from_token(
        &self,
        conn: &mut PgConnection,
        token_id: &str,
        subject: &str,
        client_id: &str,
    ) -> OidcResult<Introspection> {
        const OP: &str = "Storage.set_introspection_from_token";

        let revoked = self
            .tokens
            .is_access_token_revoked(conn, token_id)
            .await
            .map_err(|e| OidcError::from_core(OP, e))?;
        if revoked {
            return Ok(Introspection {
                active: false,
                sub: String::new(),
                client_id: String::new(),
                username: String::new(),
            });
        }

        self.claims
            .introspection(subject, client_id)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn get_private_claims_from_scopes(
        &self,
        user_id: &str,
        _client_id: &str,
        scopes: &[String],
    ) -> OidcResult<Map<String, Value>> {
        const OP: &str = "Storage.get_private_claims_from_scopes";

        let user_id = parse_subject(OP, user_id)?;
        self.claims
            .private_claims_from_scopes(user_id, scopes)
            .await
            .map_err(|e| OidcError::from_core(OP, e))
    }

    async fn health(&self, conn: &mut PgConnection) -> OidcResult<()> {
        db::ping(conn)
            .await
            .map_err(|e| OidcError::from_core("Storage.health", IdpError::from(e)))
    }
}

/// Unknown and expired refresh tokens look the same to the client.
/// Client the tokens are issued to: explicit, else the first audience entry.
fn owning_client<'a>(op: &'static str, request: &'a TokenRequest) -> OidcResult<&'a str> {
    request
        .owning_client()
        .map_err(|e| OidcError::from_core(op, e))
}

fn invalid_refresh_token(err: IdpError) -> IdpError {
    debug!(error = %err, "refresh token rejected");
    IdpError::NotFound("invalid refresh token".into())
}
