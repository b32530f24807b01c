//! Error taxonomy shared by every component.
//!
//! Errors are tagged with the operation that produced them (see
//! [`OpContext::op`]); [`IdpError::kind`] looks through the tags so callers can
//! branch on the category without caring where it was raised.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, IdpError>;

/// Core errors.
#[derive(Debug, Error)]
pub enum IdpError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Already used: {0}")]
    AlreadyUsed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("{op}: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<IdpError>,
    },
}

/// Error category, independent of where the error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    Expired,
    AlreadyUsed,
    Crypto,
    ServerError,
}

impl IdpError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdpError::Validation(_) => ErrorKind::Validation,
            IdpError::NotFound(_) => ErrorKind::NotFound,
            IdpError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            IdpError::Expired(_) => ErrorKind::Expired,
            IdpError::AlreadyUsed(_) => ErrorKind::AlreadyUsed,
            IdpError::Crypto(_) => ErrorKind::Crypto,
            IdpError::Server(_) => ErrorKind::ServerError,
            IdpError::Db(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            IdpError::Db(_) => ErrorKind::ServerError,
            IdpError::Op { source, .. } => source.kind(),
        }
    }

    /// Innermost operation tag, if any.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            IdpError::Op { op, source } => source.op().or(Some(op)),
            _ => None,
        }
    }

    /// The untagged error at the bottom of the operation chain.
    pub fn root(&self) -> &IdpError {
        match self {
            IdpError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is an expected, client-caused failure rather than an
    /// incident (unknown, expired or replayed codes and tokens, bad input).
    pub fn is_client_error(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Crypto | ErrorKind::ServerError)
    }
}

/// Attach an operation tag to a failing result.
pub trait OpContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T, E> OpContext<T> for std::result::Result<T, E>
where
    E: Into<IdpError>,
{
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| IdpError::Op {
            op,
            source: Box::new(e.into()),
        })
    }
}
