//! Protocol-level errors returned to the engine.
//!
//! Core failures are translated into the OAuth2 error codes of RFC 6749 §5.2
//! and RFC 7009 §2.2.1. Server-side failures never carry internal detail out;
//! they are logged here and replaced with a fixed description.

use std::fmt;

use idp_core::{ErrorKind, IdpError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

/// Result type for storage operations.
pub type OidcResult<T> = Result<T, OidcError>;

/// Description used for every `server_error`.
const SERVER_ERROR_DESCRIPTION: &str = "internal server error";

/// OAuth2 error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedTokenType,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidClient => "invalid_client",
            ErrorCode::InvalidGrant => "invalid_grant",
            ErrorCode::UnauthorizedClient => "unauthorized_client",
            ErrorCode::UnsupportedTokenType => "unsupported_token_type",
            ErrorCode::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error the engine can put on the wire as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code}: {description}")]
pub struct OidcError {
    #[serde(rename = "error")]
    pub code: ErrorCode,
    #[serde(rename = "error_description")]
    pub description: String,
}

impl OidcError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClient, description)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGrant, description)
    }

    pub fn unsupported_token_type(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedTokenType, description)
    }

    pub fn server_error() -> Self {
        Self::new(ErrorCode::ServerError, SERVER_ERROR_DESCRIPTION)
    }

    /// Translate a core error raised while serving `op`.
    ///
    /// Unknown, expired and replayed codes or tokens are `invalid_grant`;
    /// crypto, database and other server failures are `server_error`.
    pub fn from_core(op: &'static str, err: IdpError) -> Self {
        let code = match err.kind() {
            ErrorKind::Validation => ErrorCode::InvalidRequest,
            ErrorKind::NotFound | ErrorKind::Expired | ErrorKind::AlreadyUsed => {
                ErrorCode::InvalidGrant
            }
            ErrorKind::PermissionDenied => ErrorCode::UnauthorizedClient,
            ErrorKind::Crypto | ErrorKind::ServerError => ErrorCode::ServerError,
        };
        Self::with_code(op, code, err)
    }

    /// Like [`OidcError::from_core`], but failures to identify or
    /// authenticate the client are `invalid_client`.
    pub fn from_client_lookup(op: &'static str, err: IdpError) -> Self {
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                Self::with_code(op, ErrorCode::InvalidClient, err)
            }
            _ => Self::from_core(op, err),
        }
    }

    /// Force `code` for client errors; server errors stay `server_error`.
    pub fn with_code(op: &'static str, code: ErrorCode, err: IdpError) -> Self {
        if !err.is_client_error() {
            error!(op, error = %err, "storage operation failed");
            return Self::server_error();
        }
        debug!(op, code = %code, error = %err, "storage request rejected");
        Self::new(code, err.root().to_string())
    }
}
