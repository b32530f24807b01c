//! Provider configuration from the environment.

use chrono::Duration;
use thiserror::Error;

use crate::keys::DEFAULT_ROTATION_GRACE_SECS;
use crate::tokens::{
    DEFAULT_ACCESS_TOKEN_LIFETIME_SECS, DEFAULT_REFRESH_TOKEN_LIFETIME_SECS, TokenConfig,
};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/idp";
const DEFAULT_ISSUER: &str = "http://localhost:3100";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Provider configuration.
#[derive(Clone)]
pub struct IdpConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    pub max_connections: u32,
    /// Issuer URL placed in `iss`.
    pub issuer: String,
    /// Master secret sealing private keys at rest.
    pub crypto_key: String,
    pub access_token_lifetime: Duration,
    pub refresh_token_lifetime: Duration,
    /// How long a rotated-out key stays published.
    pub key_rotation_grace: Duration,
}

impl std::fmt::Debug for IdpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdpConfig")
            .field("database_url", &self.database_url)
            .field("max_connections", &self.max_connections)
            .field("issuer", &self.issuer)
            .field("crypto_key", &"<redacted>")
            .field("access_token_lifetime", &self.access_token_lifetime)
            .field("refresh_token_lifetime", &self.refresh_token_lifetime)
            .field("key_rotation_grace", &self.key_rotation_grace)
            .finish()
    }
}

impl IdpConfig {
    /// Reads configuration from environment variables.
    ///
    /// | Variable                            | Default                          |
    /// |-------------------------------------|----------------------------------|
    /// | `DATABASE_URL`                      | `postgres://localhost:5432/idp`  |
    /// | `DATABASE_MAX_CONNECTIONS`          | `5`                              |
    /// | `OIDC_ISSUER`                       | `http://localhost:3100`          |
    /// | `OIDC_CRYPTO_KEY`                   | required                         |
    /// | `OIDC_ACCESS_TOKEN_LIFETIME_SECS`   | `3600`                           |
    /// | `OIDC_REFRESH_TOKEN_LIFETIME_SECS`  | `2592000`                        |
    /// | `OIDC_KEY_ROTATION_GRACE_SECS`      | `86400`                          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`IdpConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let crypto_key = lookup("OIDC_CRYPTO_KEY")
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("OIDC_CRYPTO_KEY"))?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into()),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            issuer: lookup("OIDC_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.into()),
            crypto_key,
            access_token_lifetime: seconds_or(
                &lookup,
                "OIDC_ACCESS_TOKEN_LIFETIME_SECS",
                DEFAULT_ACCESS_TOKEN_LIFETIME_SECS,
            )?,
            refresh_token_lifetime: seconds_or(
                &lookup,
                "OIDC_REFRESH_TOKEN_LIFETIME_SECS",
                DEFAULT_REFRESH_TOKEN_LIFETIME_SECS,
            )?,
            key_rotation_grace: seconds_or(
                &lookup,
                "OIDC_KEY_ROTATION_GRACE_SECS",
                DEFAULT_ROTATION_GRACE_SECS,
            )?,
        })
    }

    /// Token settings derived from this config.
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            issuer: self.issuer.clone(),
            access_token_lifetime: self.access_token_lifetime,
            refresh_token_lifetime: self.refresh_token_lifetime,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn seconds_or<F>(lookup: &F, name: &'static str, default: i64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: i64 = parse_or(lookup, name, default)?;
    if secs < 0 {
        return Err(ConfigError::Invalid {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_crypto_key_is_set() {
        let config = IdpConfig::from_lookup(lookup(&[("OIDC_CRYPTO_KEY", "k")])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.issuer, DEFAULT_ISSUER);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.access_token_lifetime, Duration::hours(1));
        assert_eq!(config.refresh_token_lifetime, Duration::days(30));
        assert_eq!(config.key_rotation_grace, Duration::hours(24));
    }

    #[test]
    fn crypto_key_is_required_and_non_empty() {
        assert!(matches!(
            IdpConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("OIDC_CRYPTO_KEY"))
        ));
        assert!(IdpConfig::from_lookup(lookup(&[("OIDC_CRYPTO_KEY", "")])).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = IdpConfig::from_lookup(lookup(&[
            ("OIDC_CRYPTO_KEY", "k"),
            ("OIDC_ISSUER", "https://idp.example"),
            ("OIDC_ACCESS_TOKEN_LIFETIME_SECS", "600"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
        ]))
        .unwrap();
        assert_eq!(config.issuer, "https://idp.example");
        assert_eq!(config.access_token_lifetime, Duration::minutes(10));
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.token_config().issuer, "https://idp.example");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = IdpConfig::from_lookup(lookup(&[
            ("OIDC_CRYPTO_KEY", "k"),
            ("OIDC_KEY_ROTATION_GRACE_SECS", "a day"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("OIDC_KEY_ROTATION_GRACE_SECS"));

        assert!(
            IdpConfig::from_lookup(lookup(&[
                ("OIDC_CRYPTO_KEY", "k"),
                ("OIDC_ACCESS_TOKEN_LIFETIME_SECS", "-5"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn debug_redacts_crypto_key() {
        let config = IdpConfig::from_lookup(lookup(&[("OIDC_CRYPTO_KEY", "hunter2")])).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
