//! Authentication — Argon2id password hashing and JWT issuance.
//!
//! Token validation lives in `perch_common::auth` so the hub can check
//! viewer tokens without depending on this crate.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use perch_common::auth::Claims;

/// Hash a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against an Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a JWT access token.
pub fn generate_access_token(
    user_id: i64,
    username: &str,
    secret: &str,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_secs as i64)).timestamp(),
        token_type: "access".to_string(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong password", &hash).unwrap());
    }

    #[test]
    fn token_roundtrip_carries_identity() {
        let token = generate_access_token(42, "wren", "test-secret", 3600).unwrap();
        let claims = perch_common::auth::validate_token(&token, "test-secret").unwrap();
        assert_eq!(claims.user_id(), Some(42));
        assert_eq!(claims.username, "wren");
        assert_eq!(claims.token_type, "access");
    }

    #[test]
    fn token_rejects_wrong_secret() {
        let token = generate_access_token(42, "wren", "test-secret", 3600).unwrap();
        assert!(perch_common::auth::validate_token(&token, "other-secret").is_err());
    }
}
