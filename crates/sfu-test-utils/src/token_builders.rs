//! Builder patterns for test token construction
//!
//! Provides a fluent API for creating signed client tokens.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Map, Value};

/// Builder for creating test client tokens
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .for_user("alice")
///     .with_name("Alice")
///     .expires_in(3600)
///     .sign(TEST_JWT_SECRET);
/// ```
pub struct TestTokenBuilder {
    id: String,
    email: Option<String>,
    name: Option<String>,
    username: Option<String>,
    exp: Option<i64>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults (valid for one hour)
    pub fn new() -> Self {
        Self {
            id: "test-user".to_string(),
            email: None,
            name: None,
            username: None,
            exp: Some((Utc::now() + Duration::seconds(3600)).timestamp()),
        }
    }

    /// Set the user id
    pub fn for_user(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Omit `exp` entirely
    pub fn without_expiry(mut self) -> Self {
        self.exp = None;
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = Map::new();
        claims.insert("id".to_string(), json!(self.id));
        if let Some(email) = self.email {
            claims.insert("email".to_string(), json!(email));
        }
        if let Some(name) = self.name {
            claims.insert("name".to_string(), json!(name));
        }
        if let Some(username) = self.username {
            claims.insert("username".to_string(), json!(username));
        }
        if let Some(exp) = self.exp {
            claims.insert("exp".to_string(), json!(exp));
        }
        Value::Object(claims)
    }

    /// Build and sign with HS256
    pub fn sign(self, secret: &str) -> String {
        encode(
            &Header::default(),
            &self.build(),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("HS256 signing with a byte secret cannot fail")
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creates_claims() {
        let claims = TestTokenBuilder::new()
            .for_user("alice")
            .with_name("Alice")
            .build();

        assert_eq!(claims["id"], "alice");
        assert_eq!(claims["name"], "Alice");
        assert!(claims.get("username").is_none());
        assert!(claims["exp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_without_expiry() {
        let claims = TestTokenBuilder::default().without_expiry().build();
        assert_eq!(claims["id"], "test-user");
        assert!(claims.get("exp").is_none());
    }

    #[test]
    fn test_sign_produces_three_segments() {
        let token = TestTokenBuilder::new().sign("secret");
        assert_eq!(token.split('.').count(), 3);
    }
}
