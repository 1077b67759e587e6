//! Authentication Models

use crate::models::Role;
use serde::{Deserialize, Serialize};

/// JWT Claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // ledger user id
    pub email: String,
    pub role: Role,
    pub exp: usize, // expiration timestamp
}

impl Claims {
    /// Numeric ledger id carried in `sub`.
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
