//! Shared test utilities: throwaway databases, an in-memory user directory
//! and fixtures. Feature-gated behind `testutil`.
//!
//! ```toml
//! [dev-dependencies]
//! idp_core = { path = "../idp_core", features = ["testutil"] }
//! ```
//!
//! Database tests call [`test_database`] and return early when it yields
//! `None` (no `IDP_TEST_DATABASE_URL` and no local PostgreSQL binaries).

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

pub use postgres::DbManager;

use crate::claims::{ClaimsResolver, UserDirectory};
use crate::error::{IdpError, Result};
use crate::keys::{ActiveSigningKey, KeyManager, RSA_KEY_BITS};
use crate::models::client::{ApplicationType, Client};
use crate::models::user::UserProfile;
use crate::tokens::{TokenConfig, TokenIssuer};

/// Points tests at an existing server instead of an ephemeral one.
pub const TEST_DATABASE_URL_VAR: &str = "IDP_TEST_DATABASE_URL";

pub const TEST_MASTER_KEY: &str = "test-master-key";
pub const TEST_ISSUER: &str = "http://localhost:3100";
pub const TEST_REDIRECT_URI: &str = "http://localhost:3000/callback";

// =============================================================================
// Databases
// =============================================================================

enum Backend {
    /// A database created on `IDP_TEST_DATABASE_URL`, dropped on teardown.
    Shared { admin_url: String, name: String },
    Ephemeral(DbManager),
}

/// A migrated, empty database private to one test.
pub struct TestDatabase {
    pub pool: PgPool,
    backend: Backend,
}

impl TestDatabase {
    /// Close the pool and drop the database or stop the server.
    pub async fn teardown(self) {
        self.pool.close().await;
        match self.backend {
            Backend::Shared { admin_url, name } => {
                if let Err(e) = drop_database(&admin_url, &name).await {
                    eprintln!("failed to drop test database {name}: {e}");
                }
            }
            Backend::Ephemeral(mut manager) => {
                if let Err(e) = manager.stop().await {
                    eprintln!("failed to stop ephemeral PostgreSQL: {e}");
                }
            }
        }
    }
}

/// Provision a fresh migrated database, or `None` (with a note on stderr)
/// when no PostgreSQL is reachable.
pub async fn test_database() -> Option<TestDatabase> {
    let result = match std::env::var(TEST_DATABASE_URL_VAR) {
        Ok(url) => shared_database(&url).await,
        Err(_) => ephemeral_database().await,
    };
    match result {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("skipping database test: {e}");
            None
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn shared_database(admin_url: &str) -> std::result::Result<TestDatabase, BoxError> {
    let name = format!("idp_test_{}", Uuid::new_v4().simple());

    let admin = PgPool::connect(admin_url).await?;
    sqlx::query(&format!("CREATE DATABASE \"{name}\""))
        .execute(&admin)
        .await?;
    admin.close().await;

    let mut url = url::Url::parse(admin_url)?;
    url.set_path(&format!("/{name}"));
    let pool = PgPool::connect(url.as_str()).await?;
    crate::db::migrate(&pool).await?;

    Ok(TestDatabase {
        pool,
        backend: Backend::Shared {
            admin_url: admin_url.to_string(),
            name,
        },
    })
}

async fn ephemeral_database() -> std::result::Result<TestDatabase, BoxError> {
    let mut manager = DbManager::ephemeral().await?;
    manager.setup().await?;
    manager.start().await?;

    let pool = PgPool::connect(&manager.connection_url()).await?;
    crate::db::migrate(&pool).await?;

    Ok(TestDatabase {
        pool,
        backend: Backend::Ephemeral(manager),
    })
}

async fn drop_database(admin_url: &str, name: &str) -> std::result::Result<(), sqlx::Error> {
    let admin = PgPool::connect(admin_url).await?;
    sqlx::query(&format!("DROP DATABASE IF EXISTS \"{name}\" WITH (FORCE)"))
        .execute(&admin)
        .await?;
    admin.close().await;
    Ok(())
}

// =============================================================================
// Users
// =============================================================================

/// `UserDirectory` backed by a map.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<i64, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserProfile) {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id, user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn user_by_id(&self, user_id: i64) -> Result<UserProfile> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .cloned()
            .ok_or_else(|| IdpError::NotFound(format!("user {user_id}")))
    }
}

/// A fully populated user with a random tenant.
pub fn sample_user(id: i64) -> UserProfile {
    UserProfile {
        id,
        tenant_id: Uuid::new_v4(),
        email: format!("user{id}@example.com"),
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        middle_name: None,
        phone: Some("+15550100".into()),
        roles: vec!["admin".into(), "viewer".into()],
    }
}

/// Directory pre-populated with [`sample_user`] for each ID.
pub fn user_directory(ids: &[i64]) -> Arc<InMemoryUserDirectory> {
    let users = InMemoryUserDirectory::new();
    for id in ids {
        users.insert(sample_user(*id));
    }
    Arc::new(users)
}

// =============================================================================
// Keys, clients and components
// =============================================================================

static TEST_PRIVATE_KEY: LazyLock<rsa::RsaPrivateKey> = LazyLock::new(|| {
    rsa::RsaPrivateKey::new(&mut rsa::rand_core::OsRng, RSA_KEY_BITS)
        .expect("generate test RSA key")
});

/// A signing key shared by every test in the process.
///
/// # Panics
///
/// Panics if RSA key generation fails.
pub fn test_signing_key() -> ActiveSigningKey {
    ActiveSigningKey::new("test-key", TEST_PRIVATE_KEY.clone())
}

/// Register a public client with the given ID. PKCE is not required, and
/// refresh tokens plus `offline_access` are allowed.
///
/// # Panics
///
/// Panics if the insert fails.
pub async fn seed_client(conn: &mut PgConnection, client_id: &str) -> Client {
    let mut client = Client::new(
        client_id,
        format!("Test client {client_id}"),
        ApplicationType::Web,
        vec![TEST_REDIRECT_URI.into()],
    );
    client.require_pkce = false;
    client.grant_types.push("refresh_token".into());
    client.scopes.push("offline_access".into());
    crate::clients::create(conn, &client)
        .await
        .expect("seed client")
}

pub fn key_manager() -> KeyManager {
    KeyManager::new(TEST_MASTER_KEY)
}

pub fn token_issuer(users: Arc<dyn UserDirectory>) -> TokenIssuer {
    TokenIssuer::new(key_manager(), users, TokenConfig::new(TEST_ISSUER))
}

pub fn claims_resolver(users: Arc<dyn UserDirectory>) -> ClaimsResolver {
    ClaimsResolver::new(users)
}
