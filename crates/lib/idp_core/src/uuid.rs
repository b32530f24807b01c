// Identifier helpers.
//
// Rows whose insertion order matters (auth requests, refresh tokens) get
// UUIDv7 so they sort by creation time. Signing-key IDs are published in JWKS
// and must not leak creation time, so they use random v4.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Generate a random key ID for a signing key.
pub fn new_key_id() -> String {
    Uuid::new_v4().to_string()
}

/// Parse a textual UUID, naming the field in the error.
pub fn parse(field: &str, value: &str) -> crate::Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| crate::IdpError::Validation(format!("invalid {field}: {value:?}")))
}
