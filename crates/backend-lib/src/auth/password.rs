// ============================
// meshroom-backend/src/auth/password.rs
// ============================
//! Password hashing and verification.
use crate::config::PasswordHashSettings;
use crate::error::AppError;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::fmt;

/// Hashes room passwords with Argon2id using the configured cost
#[derive(Clone)]
pub struct RoomPasswordHasher {
    params: Params,
}

impl RoomPasswordHasher {
    pub fn new(settings: &PasswordHashSettings) -> Result<Self, AppError> {
        let params = Params::new(
            settings.memory_kib,
            settings.iterations,
            settings.parallelism,
            None,
        )
        .map_err(|e| AppError::PasswordHash(e.to_string()))?;
        Ok(Self { params })
    }

    /// Hash a password on the blocking pool
    pub async fn hash(&self, plain: String) -> Result<RoomSecret, AppError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash_sync(&plain))
            .await
            .map_err(|e| AppError::PasswordHash(format!("hashing task failed: {e}")))?
    }

    /// Hash a password into a PHC string
    pub fn hash_sync(&self, plain: &str) -> Result<RoomSecret, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2.hash_password(plain.as_bytes(), &salt)?.to_string();
        Ok(RoomSecret(hash))
    }
}

/// A room's hashed password. Never holds the plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSecret(String);

impl RoomSecret {
    /// Verify a candidate password on the blocking pool
    pub async fn verify(&self, plain: String) -> bool {
        let secret = self.clone();
        tokio::task::spawn_blocking(move || secret.verify_sync(&plain))
            .await
            .unwrap_or(false)
    }

    /// Verify a candidate password; the cost parameters come from the stored hash
    pub fn verify_sync(&self, plain: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(&self.0) else {
            return false;
        };
        Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok()
    }
}

impl fmt::Debug for RoomSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomSecret(..)")
    }
}

#[cfg(test)]
pub(crate) fn test_hasher() -> RoomPasswordHasher {
    RoomPasswordHasher::new(&PasswordHashSettings {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .unwrap()
}
