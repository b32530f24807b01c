//! End-user view consumed from the identity module.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What this core needs to know about an end user. Owned by the identity
/// module and fetched through [`crate::claims::UserDirectory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub tenant_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub roles: Vec<String>,
}
