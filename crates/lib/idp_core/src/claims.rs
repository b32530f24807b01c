//! Scope-to-claim mapping for userinfo, ID tokens and introspection.
//!
//! `email_verified` and `phone_number_verified` are always `false`: no
//! verification flow backs them, and relying parties must not authorize on
//! them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{IdpError, OpContext, Result};
use crate::models::user::UserProfile;

/// Custom scope exposing the user's tenant as a claim.
pub const SCOPE_TENANT_ID: &str = "tenant_id";
/// Custom scope exposing the user's role names as a claim.
pub const SCOPE_ROLES: &str = "roles";

/// User lookup owned by the identity module.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `NotFound` if no such user.
    async fn user_by_id(&self, user_id: i64) -> Result<UserProfile>;
}

/// Parse an OIDC subject into a numeric user ID.
pub fn parse_user_id(subject: &str) -> Result<i64> {
    subject
        .parse::<i64>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| IdpError::Validation(format!("invalid user ID: {subject:?}")))
}

/// Standard OIDC userinfo claims plus custom ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
    /// Custom claims (`tenant_id`, `roles`).
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl UserInfo {
    fn set_email(&mut self, user: &UserProfile) {
        self.email = Some(user.email.clone());
        self.email_verified = Some(false);
    }

    fn set_profile(&mut self, user: &UserProfile) {
        self.given_name = Some(user.first_name.clone());
        self.family_name = Some(user.last_name.clone());
        self.middle_name = user.middle_name.clone().filter(|m| !m.is_empty());
    }

    fn set_phone(&mut self, user: &UserProfile) {
        if let Some(phone) = &user.phone {
            self.phone_number = Some(phone.clone());
            self.phone_number_verified = Some(false);
        }
    }
}

/// Token introspection response body (RFC 7662 subset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introspection {
    pub active: bool,
    pub sub: String,
    pub client_id: String,
    /// The user's email address.
    pub username: String,
}

fn custom_claims(user: &UserProfile, scopes: &[String]) -> Map<String, Value> {
    let mut claims = Map::new();
    for scope in scopes {
        match scope.as_str() {
            SCOPE_TENANT_ID => {
                claims.insert(SCOPE_TENANT_ID.into(), json!(user.tenant_id.to_string()));
            }
            SCOPE_ROLES => {
                claims.insert(SCOPE_ROLES.into(), json!(user.roles));
            }
            _ => {}
        }
    }
    claims
}

/// Maps scopes to claims for a user fetched through the directory.
#[derive(Clone)]
pub struct ClaimsResolver {
    users: Arc<dyn UserDirectory>,
}

impl ClaimsResolver {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }

    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.users
    }

    /// Claims granted by `scopes`. Unknown scopes are ignored.
    pub async fn userinfo_from_scopes(&self, user_id: i64, scopes: &[String]) -> Result<UserInfo> {
        let user = self
            .users
            .user_by_id(user_id)
            .await
            .op("ClaimsResolver.userinfo_from_scopes")?;

        let mut info = UserInfo {
            sub: user.id.to_string(),
            ..UserInfo::default()
        };
        for scope in scopes {
            match scope.as_str() {
                "email" => info.set_email(&user),
                "profile" => info.set_profile(&user),
                "phone" => info.set_phone(&user),
                _ => {}
            }
        }
        info.claims = custom_claims(&user, scopes);
        Ok(info)
    }

    /// Every standard claim for the token's subject.
    pub async fn userinfo_for_subject(&self, subject: &str) -> Result<UserInfo> {
        const OP: &str = "ClaimsResolver.userinfo_for_subject";

        let user_id = parse_user_id(subject).op(OP)?;
        let user = self.users.user_by_id(user_id).await.op(OP)?;

        let mut info = UserInfo {
            sub: subject.to_string(),
            ..UserInfo::default()
        };
        info.set_email(&user);
        info.set_profile(&user);
        info.set_phone(&user);
        Ok(info)
    }

    /// Only the custom claims (`tenant_id`, `roles`) granted by `scopes`.
    pub async fn private_claims_from_scopes(
        &self,
        user_id: i64,
        scopes: &[String],
    ) -> Result<Map<String, Value>> {
        let user = self
            .users
            .user_by_id(user_id)
            .await
            .op("ClaimsResolver.private_claims_from_scopes")?;
        Ok(custom_claims(&user, scopes))
    }

    /// Introspection for an active token.
    pub async fn introspection(&self, subject: &str, client_id: &str) -> Result<Introspection> {
        const OP: &str = "ClaimsResolver.introspection";

        let user_id = parse_user_id(subject).op(OP)?;
        let user = self.users.user_by_id(user_id).await.op(OP)?;
        Ok(Introspection {
            active: true,
            sub: subject.to_string(),
            client_id: client_id.to_string(),
            username: user.email,
        })
    }
}
