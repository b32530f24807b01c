//! # idp_core
//!
//! Storage and signing-key core of an OIDC provider. Nothing in here knows
//! about the protocol engine in front of it; see `idp_op` for that layer.

pub mod auth_request;
pub mod claims;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod models;
pub mod tokens;
pub mod uuid;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::{ErrorKind, IdpError, OpContext, Result};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
