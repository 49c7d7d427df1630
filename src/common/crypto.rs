// Cryptographic helpers: password hashing, OTP codes and signing secrets
use argon2::{Argon2, password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString}};
use base64::{Engine as _, engine::general_purpose};
use rand::{Rng, RngCore, rngs::OsRng};
use ring::digest::{self, SHA256};
use std::env;

pub struct CryptoManager;

impl CryptoManager {
    /// Hash a password with argon2 and a random salt of `salt_length` bytes.
    pub fn hash_password(password: &str, salt_length: usize) -> Result<String, argon2::password_hash::Error> {
        // SaltString caps the encoded salt at 64 characters
        let mut salt_bytes = vec![0u8; salt_length.clamp(8, 32)];
        OsRng.fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)?;
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    pub fn verify_password(hash: &str, password: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed_hash) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Six digit one-time code, never starting with zero.
    pub fn generate_otp_code() -> String {
        OsRng.gen_range(100_000..1_000_000u32).to_string()
    }

    /// Digest stored in place of the raw OTP so a leaked store does not leak codes.
    pub fn otp_digest(email: &str, code: &str) -> String {
        let mut ctx = digest::Context::new(&SHA256);
        ctx.update(email.trim().to_lowercase().as_bytes());
        ctx.update(b":");
        ctx.update(code.trim().as_bytes());
        general_purpose::STANDARD.encode(ctx.finish().as_ref())
    }

    /// Generates a fresh 256-bit token signing secret
    pub fn generate_secret() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Loads the token signing secret from JWT_SECRET, if set and non-empty
    pub fn load_secret_from_env() -> Option<Vec<u8>> {
        env::var("JWT_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(String::into_bytes)
    }
}
