//! Command implementations. Results go to stdout as JSON; logs go to stderr.

use idp_core::auth_request::AuthRequests;
use idp_core::clients;
use idp_core::config::IdpConfig;
use idp_core::keys::KeyManager;
use idp_core::models::client::{AuthMethod, Client};
use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use crate::Result;
use crate::cli::RegisterClientArgs;

pub struct Context {
    pub config: IdpConfig,
    pub pool: PgPool,
}

impl Context {
    pub async fn connect(config: IdpConfig) -> Result<Self> {
        let pool = idp_core::db::connect(&config.database_url, config.max_connections).await?;
        Ok(Self { config, pool })
    }

    fn keys(&self) -> KeyManager {
        KeyManager::new(&self.config.crypto_key).with_rotation_grace(self.config.key_rotation_grace)
    }
}

fn print(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    info!("running database migrations");
    idp_core::db::migrate(&ctx.pool).await?;
    print(json!({ "migrated": true }))
}

pub async fn bootstrap_keys(ctx: &Context) -> Result<()> {
    let created = ctx.keys().bootstrap(&ctx.pool).await?;
    print(json!({ "created": created }))
}

pub async fn rotate_keys(ctx: &Context) -> Result<()> {
    let keys = ctx.keys();
    let key_id = keys.rotate(&ctx.pool).await?;
    print(json!({
        "key_id": key_id,
        "grace_period_secs": keys.rotation_grace().num_seconds(),
    }))
}

pub async fn retire_keys(ctx: &Context) -> Result<()> {
    let mut conn = ctx.pool.acquire().await?;
    let retired = ctx.keys().retire_expired(&mut conn).await?;
    print(json!({ "retired": retired }))
}

pub async fn sweep(ctx: &Context) -> Result<()> {
    let mut conn = ctx.pool.acquire().await?;
    let auth_requests = AuthRequests::new().delete_expired(&mut conn).await?;
    let tokens = idp_core::tokens::delete_expired(&mut conn).await?;
    info!(
        auth_requests,
        refresh_tokens = tokens.refresh_tokens,
        revoked_access_tokens = tokens.revoked_access_tokens,
        "sweep finished"
    );
    print(json!({
        "auth_requests": auth_requests,
        "refresh_tokens": tokens.refresh_tokens,
        "revoked_access_tokens": tokens.revoked_access_tokens,
    }))
}

pub async fn jwks(ctx: &Context) -> Result<()> {
    let mut conn = ctx.pool.acquire().await?;
    let key_set = ctx.keys().jwks(&mut conn).await?;
    println!("{}", serde_json::to_string_pretty(&key_set)?);
    Ok(())
}

pub async fn register_client(ctx: &Context, args: &RegisterClientArgs) -> Result<()> {
    let mut client = Client::new(
        &args.client_id,
        args.name.clone().unwrap_or_else(|| args.client_id.clone()),
        args.application_type.into(),
        args.redirect_uris.clone(),
    );
    if !args.scopes.is_empty() {
        client.scopes = args.scopes.clone();
    }
    if args.refresh_tokens {
        client.grant_types.push("refresh_token".into());
    }
    client.require_pkce = !args.no_pkce;

    let secret = if args.public {
        client.auth_method = AuthMethod::None;
        None
    } else {
        let secret = clients::generate_secret();
        client.client_secret_hash = Some(clients::hash_secret(&secret)?);
        Some(secret)
    };

    let mut conn = ctx.pool.acquire().await?;
    let client = clients::create(&mut conn, &client).await?;
    info!(client_id = %client.client_id, public = client.is_public(), "registered client");

    // The secret is only ever shown here.
    print(json!({
        "client_id": client.client_id,
        "client_secret": secret,
        "application_type": client.application_type,
        "redirect_uris": client.redirect_uris,
        "grant_types": client.grant_types,
        "scopes": client.scopes,
        "require_pkce": client.require_pkce,
    }))
}
