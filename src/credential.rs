//! Password hashing.
//!
//! Passwords are hashed with argon2id before a signup is written to the
//! ephemeral store, so the plaintext never leaves the request that carried it.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

use crate::config::PasswordHashingConfig;
use crate::models::CredentialHash;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid hashing parameters: {0}")]
    InvalidParams(String),

    #[error("failed to hash credential: {0}")]
    Hashing(String),
}

#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    pub fn new(config: &PasswordHashingConfig) -> Result<Self, CredentialError> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| CredentialError::InvalidParams(e.to_string()))?;
        Ok(Self { params })
    }

    /// Hash `password` into a PHC string with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<CredentialHash, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
            .to_string();

        Ok(CredentialHash::new(hash))
    }

    /// Runs [`hash`](Self::hash) on the blocking pool.
    pub async fn hash_blocking(&self, password: String) -> Result<CredentialHash, CredentialError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
    }
}
