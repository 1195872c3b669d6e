//! Client authentication.

pub mod claims;
pub mod jwt;

pub use claims::UserClaims;
pub use jwt::{CallerIdentity, JwtVerifier, TokenVerifier, MAX_JWT_SIZE_BYTES};
