//! Signing-key lifecycle: bootstrap, rotation, retirement and publication.
//!
//! Private keys are stored as AES-256-GCM sealed PKCS#8 DER and only ever
//! decrypted in memory. Generation and rotation run inside one transaction
//! holding a transaction-scoped advisory lock, so concurrent processes never
//! mint duplicate keys and the lock cannot outlive the transaction.

pub mod cipher;
pub mod jwks;
pub mod queries;

use chrono::{Duration, Utc};
use jsonwebtoken::EncodingKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

use crate::error::{IdpError, OpContext, Result};
use crate::models::key::{JwkSet, PublicKeyWithId, RS256};

/// RSA modulus size for generated signing keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Default time an outgoing key stays published after a rotation.
pub const DEFAULT_ROTATION_GRACE_SECS: i64 = 86_400;

// =============================================================================
// Key material
// =============================================================================

/// Freshly generated key, ready to insert.
struct GeneratedKey {
    key_id: String,
    sealed_private_key: Vec<u8>,
    public_key: Vec<u8>,
}

fn generate_key_material(master_key: &str) -> Result<GeneratedKey> {
    let mut rng = rsa::rand_core::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| IdpError::Crypto(format!("RSA key generation failed: {e}")))?;

    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| IdpError::Crypto(format!("PKCS#8 encoding failed: {e}")))?;
    let sealed_private_key = cipher::encrypt(pkcs8.as_bytes(), master_key)?;

    let public_key = private_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| IdpError::Crypto(format!("SPKI encoding failed: {e}")))?
        .as_bytes()
        .to_vec();

    Ok(GeneratedKey {
        key_id: crate::uuid::new_key_id(),
        sealed_private_key,
        public_key,
    })
}

fn open_private_key(sealed: &[u8], master_key: &str) -> Result<RsaPrivateKey> {
    let der = cipher::decrypt(sealed, master_key)?;
    RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|e| IdpError::Crypto(format!("invalid PKCS#8 private key: {e}")))
}

/// The decrypted key that signs new tokens.
pub struct ActiveSigningKey {
    pub key_id: String,
    pub algorithm: String,
    private_key: RsaPrivateKey,
}

impl ActiveSigningKey {
    pub fn new(key_id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm: RS256.into(),
            private_key,
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// RS256 signing key for `jsonwebtoken`.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| IdpError::Crypto(format!("PKCS#1 encoding failed: {e}")))?;
        Ok(EncodingKey::from_rsa_der(der.as_bytes()))
    }
}

impl std::fmt::Debug for ActiveSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// KeyManager
// =============================================================================

/// Owns the master secret and the key lifecycle.
#[derive(Clone)]
pub struct KeyManager {
    master_key: String,
    rotation_grace: Duration,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("rotation_grace", &self.rotation_grace)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn new(master_key: impl Into<String>) -> Self {
        Self {
            master_key: master_key.into(),
            rotation_grace: Duration::seconds(DEFAULT_ROTATION_GRACE_SECS),
        }
    }

    pub fn with_rotation_grace(mut self, grace: Duration) -> Self {
        self.rotation_grace = grace;
        self
    }

    pub fn rotation_grace(&self) -> Duration {
        self.rotation_grace
    }

    async fn generate(&self) -> Result<GeneratedKey> {
        let master_key = self.master_key.clone();
        tokio::task::spawn_blocking(move || generate_key_material(&master_key))
            .await
            .map_err(|e| IdpError::Server(format!("key generation task failed: {e}")))?
    }

    /// Ensure at least one active signing key exists. Safe to call from any
    /// number of processes at once; returns `true` if this call created it.
    pub async fn bootstrap(&self, pool: &PgPool) -> Result<bool> {
        const OP: &str = "KeyManager.bootstrap";

        let mut tx = pool.begin().await.op(OP)?;
        queries::lock_key_generation(&mut *tx).await.op(OP)?;

        let active = queries::count_active(&mut *tx).await.op(OP)?;
        if active > 0 {
            tx.commit().await.op(OP)?;
            debug!(active, "signing key already present");
            return Ok(false);
        }

        let key = self.generate().await.op(OP)?;
        let inserted = queries::insert(
            &mut *tx,
            &key.key_id,
            RS256,
            &key.sealed_private_key,
            &key.public_key,
        )
        .await
        .op(OP)?;
        tx.commit().await.op(OP)?;

        if inserted > 0 {
            info!(key_id = %key.key_id, "generated signing key");
        }
        Ok(inserted > 0)
    }

    /// Insert a new signing key and schedule every older active key for
    /// retirement after the grace period. Returns the new key ID.
    pub async fn rotate(&self, pool: &PgPool) -> Result<String> {
        const OP: &str = "KeyManager.rotate";

        let mut tx = pool.begin().await.op(OP)?;
        queries::lock_key_generation(&mut *tx).await.op(OP)?;

        let key = self.generate().await.op(OP)?;
        let retire_at = Utc::now() + self.rotation_grace;
        let scheduled = queries::schedule_retirement(&mut *tx, retire_at)
            .await
            .op(OP)?;
        queries::insert(
            &mut *tx,
            &key.key_id,
            RS256,
            &key.sealed_private_key,
            &key.public_key,
        )
        .await
        .op(OP)?;
        tx.commit().await.op(OP)?;

        info!(key_id = %key.key_id, scheduled, %retire_at, "rotated signing key");
        Ok(key.key_id)
    }

    /// Deactivate keys past their retirement time. Returns how many.
    pub async fn retire_expired(&self, conn: &mut PgConnection) -> Result<u64> {
        let retired = queries::retire_due(conn, Utc::now())
            .await
            .op("KeyManager.retire_expired")?;
        if retired > 0 {
            info!(retired, "retired signing keys");
        }
        Ok(retired)
    }

    /// The newest active key, decrypted.
    pub async fn active_signing_key(&self, conn: &mut PgConnection) -> Result<ActiveSigningKey> {
        const OP: &str = "KeyManager.active_signing_key";

        let row = queries::newest_active(conn)
            .await
            .op(OP)?
            .ok_or_else(|| IdpError::NotFound("no active signing key".into()))
            .op(OP)?;
        let private_key = open_private_key(&row.private_key, &self.master_key).op(OP)?;

        Ok(ActiveSigningKey {
            key_id: row.key_id,
            algorithm: row.algorithm,
            private_key,
        })
    }

    /// Every active public key with its key ID, newest first. Rows that fail
    /// to parse are skipped.
    pub async fn public_keys_with_ids(&self, conn: &mut PgConnection) -> Result<Vec<PublicKeyWithId>> {
        let rows = queries::active_public_keys(conn)
            .await
            .op("KeyManager.public_keys_with_ids")?;

        let keys = rows
            .into_iter()
            .filter_map(|(key_id, der)| match RsaPublicKey::from_public_key_der(&der) {
                Ok(public_key) => Some(PublicKeyWithId { key_id, public_key }),
                Err(e) => {
                    warn!(%key_id, error = %e, "skipping unreadable public key");
                    None
                }
            })
            .collect();
        Ok(keys)
    }

    pub async fn public_keys(&self, conn: &mut PgConnection) -> Result<Vec<RsaPublicKey>> {
        Ok(self
            .public_keys_with_ids(conn)
            .await?
            .into_iter()
            .map(|k| k.public_key)
            .collect())
    }

    /// The published JSON Web Key Set.
    pub async fn jwks(&self, conn: &mut PgConnection) -> Result<JwkSet> {
        let keys = self.public_keys_with_ids(conn).await?;
        Ok(jwks::jwk_set(&keys))
    }
}
