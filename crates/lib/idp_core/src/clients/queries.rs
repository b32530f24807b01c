//! Client registry queries.

use sqlx::PgConnection;

use crate::models::client::{Client, ClientRow};

/// Fetch a client by its public client ID.
pub async fn find_by_client_id(
    conn: &mut PgConnection,
    client_id: &str,
) -> Result<Option<ClientRow>, sqlx::Error> {
    sqlx::query_as::<_, ClientRow>("SELECT * FROM oidc_clients WHERE client_id = $1")
        .bind(client_id)
        .fetch_optional(conn)
        .await
}

/// Insert a client, returning the stored row.
pub async fn insert(conn: &mut PgConnection, client: &Client) -> Result<ClientRow, sqlx::Error> {
    sqlx::query_as::<_, ClientRow>(
        "INSERT INTO oidc_clients ( \
             id, client_id, client_secret_hash, name, application_type, redirect_uris, \
             grant_types, response_types, scopes, auth_method, access_token_lifetime_secs, \
             id_token_lifetime_secs, refresh_token_lifetime_secs, require_pkce, is_active \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING *",
    )
    .bind(client.id)
    .bind(&client.client_id)
    .bind(&client.client_secret_hash)
    .bind(&client.name)
    .bind(client.application_type.as_str())
    .bind(&client.redirect_uris)
    .bind(&client.grant_types)
    .bind(&client.response_types)
    .bind(&client.scopes)
    .bind(client.auth_method.as_str())
    .bind(client.access_token_lifetime.num_seconds())
    .bind(client.id_token_lifetime.num_seconds())
    .bind(client.refresh_token_lifetime.num_seconds())
    .bind(client.require_pkce)
    .bind(client.is_active)
    .fetch_one(conn)
    .await
}

/// Flip a client's active flag. Returns rows affected.
pub async fn set_active(
    conn: &mut PgConnection,
    client_id: &str,
    active: bool,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE oidc_clients SET is_active = $2, updated_at = now() WHERE client_id = $1",
    )
    .bind(client_id)
    .bind(active)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}
