//! Authorization request state machine.
//!
//! `Created → Authenticated → Redeemed`, with `Expired` derived from the TTL.
//! Transitions are conditional updates, so a concurrent caller either wins the
//! transition or gets a typed error explaining why it lost.

pub mod queries;

use chrono::{Duration, Utc};
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::clients;
use crate::error::{IdpError, OpContext, Result};
use crate::models::auth_request::{AuthRequest, NewAuthRequest, auth_request_ttl};

/// Authorization request operations. Holds only the TTL; every call runs on
/// the connection or transaction the caller hands in.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequests {
    ttl: Duration,
}

impl Default for AuthRequests {
    fn default() -> Self {
        Self {
            ttl: auth_request_ttl(),
        }
    }
}

impl AuthRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Validate against the client registry and persist a new request.
    pub async fn create(&self, conn: &mut PgConnection, new: NewAuthRequest) -> Result<AuthRequest> {
        const OP: &str = "AuthRequests.create";

        let client = clients::get_by_client_id(conn, &new.client_id).await.op(OP)?;
        if !client.is_active {
            return Err(IdpError::PermissionDenied(format!(
                "client {} is inactive",
                client.client_id
            )))
            .op(OP);
        }
        if !client.validate_redirect_uri(&new.redirect_uri) {
            return Err(IdpError::Validation(format!(
                "redirect_uri not registered for client {}",
                client.client_id
            )))
            .op(OP);
        }
        if !client.validate_response_type(&new.response_type) {
            return Err(IdpError::Validation(format!(
                "response_type {:?} not allowed",
                new.response_type
            )))
            .op(OP);
        }
        if client.require_pkce && new.code_challenge.is_none() {
            return Err(IdpError::Validation("code_challenge required".into())).op(OP);
        }
        if matches!(&new.code_challenge, Some(c) if c.challenge.is_empty()) {
            return Err(IdpError::Validation("code_challenge is empty".into())).op(OP);
        }

        let now = Utc::now();
        let auth_time = new.authenticated.map(|_| now);
        let request = queries::insert(conn, crate::uuid::uuidv7(), &new, auth_time, now + self.ttl)
            .await
            .op(OP)?;

        debug!(
            auth_request_id = %request.id,
            client_id = %request.client_id,
            authenticated = request.is_authenticated(),
            "created auth request"
        );
        Ok(request)
    }

    /// Fetch a live request. `Expired` once past its TTL.
    pub async fn get_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<AuthRequest> {
        const OP: &str = "AuthRequests.get_by_id";

        let request = queries::find_by_id(conn, id)
            .await
            .op(OP)?
            .ok_or_else(|| IdpError::NotFound(format!("auth request {id}")))
            .op(OP)?;
        if request.is_expired(Utc::now()) {
            return Err(IdpError::Expired(format!("auth request {id}"))).op(OP);
        }
        Ok(request)
    }

    /// Record the end user who logged in for this request. Allowed only from
    /// `Created`.
    pub async fn complete_authentication(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        user_id: i64,
        tenant_id: Uuid,
    ) -> Result<AuthRequest> {
        const OP: &str = "AuthRequests.complete_authentication";

        let now = Utc::now();
        if let Some(request) = queries::mark_authenticated(conn, id, user_id, tenant_id, now)
            .await
            .op(OP)?
        {
            debug!(auth_request_id = %id, "auth request authenticated");
            return Ok(request);
        }

        let current = queries::find_by_id(conn, id).await.op(OP)?;
        Err(match current {
            None => IdpError::NotFound(format!("auth request {id}")),
            Some(r) if r.is_expired(now) => IdpError::Expired(format!("auth request {id}")),
            Some(_) => IdpError::Validation(format!("auth request {id} already authenticated")),
        })
        .op(OP)
    }

    /// Attach the engine-generated authorization code.
    pub async fn save_code(&self, conn: &mut PgConnection, id: Uuid, code: &str) -> Result<()> {
        const OP: &str = "AuthRequests.save_code";

        if code.is_empty() {
            return Err(IdpError::Validation("empty authorization code".into())).op(OP);
        }

        let now = Utc::now();
        if queries::attach_code(conn, id, code, now).await.op(OP)?.is_some() {
            debug!(auth_request_id = %id, "code attached");
            return Ok(());
        }

        let current = queries::find_by_id(conn, id).await.op(OP)?;
        Err(match current {
            None => IdpError::NotFound(format!("auth request {id}")),
            Some(r) if r.is_expired(now) => IdpError::Expired(format!("auth request {id}")),
            Some(r) if !r.is_authenticated() => {
                IdpError::Validation(format!("auth request {id} is not authenticated"))
            }
            Some(r) if r.code_used => IdpError::AlreadyUsed(format!("auth request {id}")),
            Some(_) => IdpError::Validation(format!("auth request {id} already has a code")),
        })
        .op(OP)
    }

    /// Redeem an authorization code. Exactly one caller ever succeeds for a
    /// given code; the rest get `AlreadyUsed`.
    pub async fn redeem_by_code(&self, conn: &mut PgConnection, code: &str) -> Result<AuthRequest> {
        const OP: &str = "AuthRequests.redeem_by_code";

        let now = Utc::now();
        if let Some(request) = queries::redeem_code(conn, code, now).await.op(OP)? {
            debug!(auth_request_id = %request.id, "code redeemed");
            return Ok(request);
        }

        let current = queries::find_by_code(conn, code).await.op(OP)?;
        Err(match current {
            None => IdpError::NotFound("authorization code".into()),
            Some(r) if r.is_expired(now) => IdpError::Expired("authorization code".into()),
            Some(_) => IdpError::AlreadyUsed("authorization code".into()),
        })
        .op(OP)
    }

    /// Delete a request. Deleting an unknown ID is not an error.
    pub async fn delete(&self, conn: &mut PgConnection, id: Uuid) -> Result<()> {
        let deleted = queries::delete(conn, id).await.op("AuthRequests.delete")?;
        debug!(auth_request_id = %id, deleted, "auth request deleted");
        Ok(())
    }

    /// Sweep requests past their TTL. Returns how many were removed.
    pub async fn delete_expired(&self, conn: &mut PgConnection) -> Result<u64> {
        let deleted = queries::delete_expired(conn, Utc::now())
            .await
            .op("AuthRequests.delete_expired")?;
        if deleted > 0 {
            debug!(deleted, "swept expired auth requests");
        }
        Ok(deleted)
    }
}
