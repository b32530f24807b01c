//! Refresh-token and access-token denylist queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::token::RefreshToken;

// =============================================================================
// Refresh tokens
// =============================================================================

/// Insert input. `token_hash` is the hex SHA-256 of the raw token.
#[derive(Debug)]
pub struct NewRefreshToken<'a> {
    pub id: Uuid,
    pub token_hash: &'a str,
    pub client_id: &'a str,
    pub user_id: i64,
    pub tenant_id: Uuid,
    pub scopes: &'a [String],
    pub audience: &'a [String],
    pub amr: &'a [String],
    pub auth_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert_refresh(
    conn: &mut PgConnection,
    token: &NewRefreshToken<'_>,
) -> Result<RefreshToken, sqlx::Error> {
    sqlx::query_as::<_, RefreshToken>(
        "INSERT INTO oidc_refresh_tokens ( \
             id, token_hash, client_id, user_id, tenant_id, scopes, audience, amr, \
             auth_time, expires_at \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(token.id)
    .bind(token.token_hash)
    .bind(token.client_id)
    .bind(token.user_id)
    .bind(token.tenant_id)
    .bind(token.scopes)
    .bind(token.audience)
    .bind(token.amr)
    .bind(token.auth_time)
    .bind(token.expires_at)
    .fetch_one(conn)
    .await
}

pub async fn find_refresh_by_hash(
    conn: &mut PgConnection,
    token_hash: &str,
) -> Result<Option<RefreshToken>, sqlx::Error> {
    sqlx::query_as::<_, RefreshToken>("SELECT * FROM oidc_refresh_tokens WHERE token_hash = $1")
        .bind(token_hash)
        .fetch_optional(conn)
        .await
}

/// Delete a refresh token only if it belongs to `client_id`.
pub async fn delete_refresh_for_client(
    conn: &mut PgConnection,
    token_hash: &str,
    client_id: &str,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM oidc_refresh_tokens WHERE token_hash = $1 AND client_id = $2")
            .bind(token_hash)
            .bind(client_id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// Delete and return a live refresh token owned by `client_id`. `None` if it
/// is unknown, foreign or expired.
pub async fn consume_refresh(
    conn: &mut PgConnection,
    token_hash: &str,
    client_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<RefreshToken>, sqlx::Error> {
    sqlx::query_as::<_, RefreshToken>(
        "DELETE FROM oidc_refresh_tokens \
         WHERE token_hash = $1 AND client_id = $2 AND expires_at > $3 \
         RETURNING *",
    )
    .bind(token_hash)
    .bind(client_id)
    .bind(now)
    .fetch_optional(conn)
    .await
}

pub async fn delete_refresh_for_session(
    conn: &mut PgConnection,
    user_id: i64,
    client_id: &str,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM oidc_refresh_tokens WHERE user_id = $1 AND client_id = $2")
            .bind(user_id)
            .bind(client_id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

pub async fn delete_expired_refresh(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM oidc_refresh_tokens WHERE expires_at <= $1")
        .bind(now)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

// =============================================================================
// Access-token denylist
// =============================================================================

/// Denylist a token ID until `expires_at`. An existing entry keeps the later
/// of the two expiries.
pub async fn insert_revoked(
    conn: &mut PgConnection,
    jti: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO oidc_revoked_access_tokens (jti, expires_at) VALUES ($1, $2) \
         ON CONFLICT (jti) DO UPDATE \
         SET expires_at = GREATEST(oidc_revoked_access_tokens.expires_at, EXCLUDED.expires_at)",
    )
    .bind(jti)
    .bind(expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn is_revoked(
    conn: &mut PgConnection,
    jti: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM oidc_revoked_access_tokens WHERE jti = $1 AND expires_at > $2)",
    )
    .bind(jti)
    .bind(now)
    .fetch_one(conn)
    .await
}

pub async fn delete_expired_revoked(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM oidc_revoked_access_tokens WHERE expires_at <= $1")
        .bind(now)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
