//! Client token claims.
//!
//! `id` and `email` identify a person and are redacted in Debug output.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Claims carried by a client access token.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// User identifier - redacted in Debug output.
    pub id: String,

    /// Email address - redacted in Debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Expiration timestamp (Unix epoch seconds). Validated when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("id", &"[REDACTED]")
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("name", &self.name)
            .field("username", &self.username)
            .field("exp", &self.exp)
            .finish()
    }
}

impl UserClaims {
    /// Name shown to peers: `name`, falling back to `username`.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.name
            .as_ref()
            .or(self.username.as_ref())
            .filter(|n| !n.is_empty())
            .cloned()
    }
}
