use std::fmt;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use axum::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("malformed password hash: {0}")]
    Malformed(String),
    #[error("invalid hash cost: {0}")]
    Cost(String),
    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// PHC-formatted password hash. Only a hasher or the store can produce one.
#[derive(Clone, PartialEq, Eq)]
pub struct HashedPassword(String);

impl HashedPassword {
    pub(crate) fn from_phc(phc: String) -> Self {
        Self(phc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashedPassword([REDACTED])")
    }
}

/// One-way salted password hashing.
///
/// `hash` takes the plaintext by value so the caller cannot keep using it
/// after the hash is derived.
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, plaintext: SecretString) -> Result<HashedPassword, HashError>;
    async fn verify(&self, plaintext: SecretString, hash: &HashedPassword)
        -> Result<bool, HashError>;
}

/// Argon2 work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Argon2id hasher; hashing runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    pub fn new(cost: HashCost) -> Result<Self, HashError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| HashError::Cost(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(params: Params) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

#[async_trait]
impl PasswordHasher for Argon2Hasher {
    async fn hash(&self, plaintext: SecretString) -> Result<HashedPassword, HashError> {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            let hash = Self::argon2(params)
                .hash_password(plaintext.expose_secret().as_bytes(), &salt)
                .map_err(|e| {
                    error!(error = %e, "argon2 hash_password error");
                    HashError::Hash(e.to_string())
                })?
                .to_string();
            Ok(HashedPassword(hash))
        })
        .await?
    }

    async fn verify(
        &self,
        plaintext: SecretString,
        hash: &HashedPassword,
    ) -> Result<bool, HashError> {
        let phc = hash.0.clone();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&phc).map_err(|e| {
                error!(error = %e, "argon2 parse hash error");
                HashError::Malformed(e.to_string())
            })?;
            // Cost parameters come from the PHC string, not from `self`.
            Ok(Argon2::default()
                .verify_password(plaintext.expose_secret().as_bytes(), &parsed)
                .is_ok())
        })
        .await?
    }
}

/// Cheap hasher so tests don't spend seconds in argon2.
#[cfg(test)]
pub(crate) fn fast_hasher() -> Argon2Hasher {
    Argon2Hasher::new(HashCost {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    })
    .expect("valid test cost")
}
