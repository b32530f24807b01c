//! Signing-key database queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::models::key::SigningKeyRow;

/// Advisory lock ID reserved for signing-key generation.
pub const KEY_GENERATION_LOCK_ID: i64 = 1;

/// Take the key-generation advisory lock for the rest of the current
/// transaction. Released by Postgres at commit or rollback.
pub async fn lock_key_generation(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(KEY_GENERATION_LOCK_ID)
        .execute(conn)
        .await?;
    Ok(())
}

/// Count active signing keys.
pub async fn count_active(conn: &mut PgConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM oidc_signing_keys WHERE is_active = true")
        .fetch_one(conn)
        .await
}

/// Insert a new active key. Returns 0 if the key ID already existed.
pub async fn insert(
    conn: &mut PgConnection,
    key_id: &str,
    algorithm: &str,
    sealed_private_key: &[u8],
    public_key: &[u8],
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO oidc_signing_keys (key_id, algorithm, private_key, public_key, is_active) \
         VALUES ($1, $2, $3, $4, true) \
         ON CONFLICT (key_id) DO NOTHING",
    )
    .bind(key_id)
    .bind(algorithm)
    .bind(sealed_private_key)
    .bind(public_key)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Fetch the most recently created active key.
pub async fn newest_active(conn: &mut PgConnection) -> Result<Option<SigningKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, SigningKeyRow>(
        "SELECT key_id, algorithm, private_key, public_key, is_active, created_at, retire_at \
         FROM oidc_signing_keys \
         WHERE is_active = true \
         ORDER BY created_at DESC, key_id DESC \
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

/// Fetch `(key_id, public_key)` for every active key, newest first.
pub async fn active_public_keys(
    conn: &mut PgConnection,
) -> Result<Vec<(String, Vec<u8>)>, sqlx::Error> {
    sqlx::query_as::<_, (String, Vec<u8>)>(
        "SELECT key_id, public_key FROM oidc_signing_keys \
         WHERE is_active = true \
         ORDER BY created_at DESC, key_id DESC",
    )
    .fetch_all(conn)
    .await
}

/// Stamp a retirement time on every active key that has none yet.
pub async fn schedule_retirement(
    conn: &mut PgConnection,
    retire_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE oidc_signing_keys SET retire_at = $1 \
         WHERE is_active = true AND retire_at IS NULL",
    )
    .bind(retire_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Deactivate keys whose retirement time has passed. The newest active key
/// is never deactivated, so signing always has a key.
pub async fn retire_due(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE oidc_signing_keys SET is_active = false \
         WHERE is_active = true \
           AND retire_at IS NOT NULL \
           AND retire_at <= $1 \
           AND key_id <> ( \
               SELECT key_id FROM oidc_signing_keys \
               WHERE is_active = true \
               ORDER BY created_at DESC, key_id DESC \
               LIMIT 1 \
           )",
    )
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}
