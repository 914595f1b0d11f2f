// ==============================================================================
// security.rs - Security Functions (Token Generation, Password Hashing)
// ==============================================================================
// Description: API token generation and Argon2id password hashing
// Author: Matt Barham
// Created: 2025-12-15
// Modified: 2025-12-15
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Token length in bytes (32 bytes = 256 bits)
const TOKEN_BYTES: usize = 32;

/// Generates a cryptographically secure API token, presented to clients
/// as `Authorization: Token <hex>`.
///
/// The raw token is returned exactly once at creation; only its SHA-256
/// digest is persisted.
pub fn generate_token() -> Result<String> {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes);
    Ok(hex::encode(bytes))
}

/// Digest of a presented token, matching the stored `token_digest`.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Hashes a password using Argon2id with secure parameters
///
/// Memory: 47104 KiB (46 MiB), Iterations: 3, Parallelism: 4. The
/// returned hash string is in PHC format.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let params = Params::new(47104, 3, 4, None).context("Failed to create Argon2 parameters")?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .context("Failed to hash password")?
        .to_string();

    Ok(password_hash)
}

/// Verifies a password against an Argon2id hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash).context("Failed to parse password hash")?;

    let argon2 = Argon2::default();

    match argon2.verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("Password verification error: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token() {
        let token = generate_token().unwrap();

        // 32 bytes hex-encoded.
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let token2 = generate_token().unwrap();
        assert_ne!(token, token2);
    }

    #[test]
    fn test_token_digest_is_stable() {
        let token = "deadbeef";
        assert_eq!(token_digest(token), token_digest(token));
        assert_ne!(token_digest(token), token_digest("deadbeee"));
        assert_eq!(token_digest(token).len(), 64);
    }

    #[test]
    fn test_hash_password() {
        let password = "TestPassword123!";
        let hash = hash_password(password).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("$v=19$"));

        // Different salts, different hashes.
        let hash2 = hash_password(password).unwrap();
        assert_ne!(hash, hash2);
    }

    #[test]
    fn test_verify_password() {
        let password = "CorrectPassword123!";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("WrongPassword", &hash).unwrap());
        assert!(verify_password("password", "not-a-valid-hash").is_err());
    }
}
