//! HS256 token verification for client connections.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted
//! - `exp` is validated when present
//! - Every failure maps to one generic client-facing error

use crate::auth::claims::UserClaims;
use crate::errors::SfuError;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use tracing::debug;

/// Maximum accepted token size in bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

const INVALID_TOKEN: &str = "The access token is invalid or expired";

/// Verified caller identity, the only fact the SFU consumes from auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
    pub display_name: Option<String>,
}

/// Verifies a bearer credential presented at connect time.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<CallerIdentity, SfuError>;
}

/// HS256 verifier using the configured shared secret.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = true;

        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<CallerIdentity, SfuError> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            debug!(
                target: "sfu.auth",
                token_size = token.len(),
                max_size = MAX_JWT_SIZE_BYTES,
                "Token rejected: size exceeds maximum"
            );
            return Err(SfuError::AuthRejected(INVALID_TOKEN.to_string()));
        }

        let token_data =
            decode::<UserClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
                debug!(target: "sfu.auth", error = %e, "Token verification failed");
                SfuError::AuthRejected(INVALID_TOKEN.to_string())
            })?;

        let claims = token_data.claims;
        if claims.id.trim().is_empty() {
            debug!(target: "sfu.auth", "Token rejected: empty id claim");
            return Err(SfuError::AuthRejected(INVALID_TOKEN.to_string()));
        }

        debug!(target: "sfu.auth", "Token verified");
        Ok(CallerIdentity {
            display_name: claims.display_name(),
            id: claims.id,
        })
    }
}
