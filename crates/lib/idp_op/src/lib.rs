//! # idp_op
//!
//! Adapter between an OpenID provider engine and `idp_core`. The engine sees
//! the [`OpStorage`] trait and OAuth2 error codes; everything behind it is
//! delegated to the core components.

pub mod error;
pub mod storage;
pub mod types;

pub use error::{ErrorCode, OidcError, OidcResult};
pub use storage::{OpStorage, Storage};
pub use types::{
    AuthorizeRequest, RefreshTokenInfo, RefreshTokenRequest, SIGNATURE_ALGORITHM, TokenPair,
    VerificationKey,
};
