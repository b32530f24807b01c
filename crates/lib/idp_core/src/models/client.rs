//! Registered OAuth2/OIDC client applications.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// OIDC application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Web,
    Native,
    UserAgent,
}

impl ApplicationType {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::Web => "web",
            ApplicationType::Native => "native",
            ApplicationType::UserAgent => "user_agent",
        }
    }

    /// Unknown values fall back to `web`.
    pub fn parse(value: &str) -> Self {
        match value {
            "native" => ApplicationType::Native,
            "user_agent" => ApplicationType::UserAgent,
            _ => ApplicationType::Web,
        }
    }
}

/// Token endpoint authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

impl AuthMethod {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ClientSecretBasic => "client_secret_basic",
            AuthMethod::ClientSecretPost => "client_secret_post",
            AuthMethod::None => "none",
        }
    }

    /// Unknown values fall back to `client_secret_basic`.
    pub fn parse(value: &str) -> Self {
        match value {
            "client_secret_post" => AuthMethod::ClientSecretPost,
            "none" => AuthMethod::None,
            _ => AuthMethod::ClientSecretBasic,
        }
    }
}

// =============================================================================
// Domain model
// =============================================================================

/// A registered client.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: Uuid,
    pub client_id: String,
    /// bcrypt hash; `None` for public (PKCE-only) clients.
    pub client_secret_hash: Option<String>,
    pub name: String,
    pub application_type: ApplicationType,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub auth_method: AuthMethod,
    pub access_token_lifetime: Duration,
    pub id_token_lifetime: Duration,
    pub refresh_token_lifetime: Duration,
    pub require_pkce: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// New active client with the registry defaults: authorization-code grant,
    /// `code` response type, `openid profile email`, PKCE required, lifetimes
    /// of one hour (access, ID) and 30 days (refresh).
    pub fn new(
        client_id: impl Into<String>,
        name: impl Into<String>,
        application_type: ApplicationType,
        redirect_uris: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            client_secret_hash: None,
            name: name.into(),
            application_type,
            redirect_uris,
            grant_types: vec!["authorization_code".into()],
            response_types: vec!["code".into()],
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
            auth_method: AuthMethod::ClientSecretBasic,
            access_token_lifetime: Duration::hours(1),
            id_token_lifetime: Duration::hours(1),
            refresh_token_lifetime: Duration::hours(720),
            require_pkce: true,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Public clients authenticate with PKCE only.
    pub fn is_public(&self) -> bool {
        self.client_secret_hash.is_none()
    }

    pub fn validate_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn validate_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn validate_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    pub fn validate_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

// =============================================================================
// DB row structs
// =============================================================================

/// Database row for `oidc_clients`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClientRow {
    pub id: Uuid,
    pub client_id: String,
    pub client_secret_hash: Option<String>,
    pub name: String,
    pub application_type: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub auth_method: String,
    pub access_token_lifetime_secs: i64,
    pub id_token_lifetime_secs: i64,
    pub refresh_token_lifetime_secs: i64,
    pub require_pkce: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: row.id,
            client_id: row.client_id,
            client_secret_hash: row.client_secret_hash,
            name: row.name,
            application_type: ApplicationType::parse(&row.application_type),
            redirect_uris: row.redirect_uris,
            grant_types: row.grant_types,
            response_types: row.response_types,
            scopes: row.scopes,
            auth_method: AuthMethod::parse(&row.auth_method),
            access_token_lifetime: Duration::seconds(row.access_token_lifetime_secs),
            id_token_lifetime: Duration::seconds(row.id_token_lifetime_secs),
            refresh_token_lifetime: Duration::seconds(row.refresh_token_lifetime_secs),
            require_pkce: row.require_pkce,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
