//! Authorization request queries.
//!
//! Every state transition is a single conditional `UPDATE ... RETURNING *`;
//! a missing row means the guard failed and the caller diagnoses why.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::auth_request::{AuthRequest, NewAuthRequest};

pub async fn insert(
    conn: &mut PgConnection,
    id: Uuid,
    new: &NewAuthRequest,
    auth_time: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
) -> Result<AuthRequest, sqlx::Error> {
    let (challenge, method) = match &new.code_challenge {
        Some(c) => (Some(c.challenge.as_str()), Some(c.method.as_str())),
        None => (None, None),
    };
    let (user_id, tenant_id) = match new.authenticated {
        Some(a) => (Some(a.user_id), Some(a.tenant_id)),
        None => (None, None),
    };

    sqlx::query_as::<_, AuthRequest>(
        "INSERT INTO oidc_auth_requests ( \
             id, client_id, redirect_uri, scopes, response_type, state, nonce, \
             code_challenge, code_challenge_method, user_id, tenant_id, auth_time, expires_at \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING *",
    )
    .bind(id)
    .bind(&new.client_id)
    .bind(&new.redirect_uri)
    .bind(&new.scopes)
    .bind(&new.response_type)
    .bind(&new.state)
    .bind(&new.nonce)
    .bind(challenge)
    .bind(method)
    .bind(user_id)
    .bind(tenant_id)
    .bind(auth_time)
    .bind(expires_at)
    .fetch_one(conn)
    .await
}

pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<AuthRequest>, sqlx::Error> {
    sqlx::query_as::<_, AuthRequest>("SELECT * FROM oidc_auth_requests WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn find_by_code(
    conn: &mut PgConnection,
    code: &str,
) -> Result<Option<AuthRequest>, sqlx::Error> {
    sqlx::query_as::<_, AuthRequest>("SELECT * FROM oidc_auth_requests WHERE code = $1")
        .bind(code)
        .fetch_optional(conn)
        .await
}

/// `Created → Authenticated`, only while unexpired and not yet authenticated.
pub async fn mark_authenticated(
    conn: &mut PgConnection,
    id: Uuid,
    user_id: i64,
    tenant_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<AuthRequest>, sqlx::Error> {
    sqlx::query_as::<_, AuthRequest>(
        "UPDATE oidc_auth_requests \
         SET user_id = $2, tenant_id = $3, auth_time = $4 \
         WHERE id = $1 AND user_id IS NULL AND expires_at > $4 \
         RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .bind(tenant_id)
    .bind(now)
    .fetch_optional(conn)
    .await
}

/// Attach a code to an authenticated, unexpired, unredeemed request that has
/// none yet.
pub async fn attach_code(
    conn: &mut PgConnection,
    id: Uuid,
    code: &str,
    now: DateTime<Utc>,
) -> Result<Option<AuthRequest>, sqlx::Error> {
    sqlx::query_as::<_, AuthRequest>(
        "UPDATE oidc_auth_requests SET code = $2 \
         WHERE id = $1 \
           AND user_id IS NOT NULL \
           AND code IS NULL \
           AND code_used = false \
           AND expires_at > $3 \
         RETURNING *",
    )
    .bind(id)
    .bind(code)
    .bind(now)
    .fetch_optional(conn)
    .await
}

/// Flip `code_used` exactly once. Concurrent callers race on the row lock;
/// only one sees a row.
pub async fn redeem_code(
    conn: &mut PgConnection,
    code: &str,
    now: DateTime<Utc>,
) -> Result<Option<AuthRequest>, sqlx::Error> {
    sqlx::query_as::<_, AuthRequest>(
        "UPDATE oidc_auth_requests SET code_used = true \
         WHERE code = $1 AND code_used = false AND expires_at > $2 \
         RETURNING *",
    )
    .bind(code)
    .bind(now)
    .fetch_optional(conn)
    .await
}

pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM oidc_auth_requests WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_expired(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM oidc_auth_requests WHERE expires_at <= $1")
        .bind(now)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
