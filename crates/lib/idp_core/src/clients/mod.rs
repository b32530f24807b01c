//! Client registry: lookup, registration and secret checks.

pub mod queries;

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{IdpError, OpContext, Result};
use crate::models::client::Client;

/// bcrypt cost factor for client secrets.
const BCRYPT_COST: u32 = 10;

/// Length of generated client secrets.
const SECRET_LEN: usize = 48;

/// Fetch a registered client. `NotFound` if unknown.
pub async fn get_by_client_id(conn: &mut PgConnection, client_id: &str) -> Result<Client> {
    const OP: &str = "clients.get_by_client_id";
    queries::find_by_client_id(conn, client_id)
        .await
        .op(OP)?
        .map(Client::from)
        .ok_or_else(|| IdpError::NotFound(format!("client {client_id}")))
        .op(OP)
}

/// Register a client. The secret, if any, must already be hashed.
pub async fn create(conn: &mut PgConnection, client: &Client) -> Result<Client> {
    let row = queries::insert(conn, client).await.op("clients.create")?;
    debug!(client_id = %row.client_id, "registered client");
    Ok(row.into())
}

/// Enable or disable a client.
pub async fn set_active(conn: &mut PgConnection, client_id: &str, active: bool) -> Result<()> {
    const OP: &str = "clients.set_active";
    let updated = queries::set_active(conn, client_id, active).await.op(OP)?;
    if updated == 0 {
        return Err(IdpError::NotFound(format!("client {client_id}"))).op(OP);
    }
    Ok(())
}

/// Authenticate a client by ID and secret. Public clients pass with any
/// secret; PKCE is their proof.
pub async fn authorize_secret(
    conn: &mut PgConnection,
    client_id: &str,
    secret: &str,
) -> Result<Client> {
    const OP: &str = "clients.authorize_secret";

    let client = get_by_client_id(conn, client_id).await.op(OP)?;
    check_secret(&client, secret).op(OP)?;
    Ok(client)
}

/// Secret check against an already-loaded client.
pub fn check_secret(client: &Client, secret: &str) -> Result<()> {
    if !client.is_active {
        return Err(IdpError::PermissionDenied(format!(
            "client {} is inactive",
            client.client_id
        )));
    }
    let Some(hash) = client.client_secret_hash.as_deref() else {
        return Ok(());
    };
    if verify_secret(secret, hash)? {
        Ok(())
    } else {
        Err(IdpError::PermissionDenied(format!(
            "invalid secret for client {}",
            client.client_id
        )))
    }
}

/// Hash a client secret with bcrypt.
pub fn hash_secret(secret: &str) -> Result<String> {
    bcrypt::hash(secret, BCRYPT_COST).map_err(|e| IdpError::Crypto(format!("bcrypt hash: {e}")))
}

/// Verify a client secret against a bcrypt hash.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool> {
    bcrypt::verify(secret, hash).map_err(|e| IdpError::Crypto(format!("bcrypt verify: {e}")))
}

/// Generate a random client secret.
pub fn generate_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
