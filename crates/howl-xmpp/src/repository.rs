//! Storage contracts consumed by the core.
//!
//! Persistence backends live outside this crate; they plug in by
//! implementing these traits. An in-memory implementation backs tests and
//! single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::scram::{generate_salt, salted_password, ScramHash, DEFAULT_ITERATIONS};

/// Repository failures.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Cleartext password, kept only when DIGEST-MD5 is enabled.
    pub password: Option<String>,
    pub salted_pw_sha1: Vec<u8>,
    pub salted_pw_sha256: Vec<u8>,
    pub salt: Vec<u8>,
    pub iteration_count: u32,
    /// Serialized last available/unavailable presence.
    pub last_presence: Option<String>,
}

impl User {
    /// Create a user, deriving a fresh salt and both salted passwords.
    pub fn with_password(username: impl Into<String>, password: &str, iterations: u32) -> Self {
        let iterations = if iterations == 0 {
            DEFAULT_ITERATIONS
        } else {
            iterations
        };
        let salt = generate_salt();
        Self {
            username: username.into(),
            password: None,
            salted_pw_sha1: salted_password(ScramHash::Sha1, password.as_bytes(), &salt, iterations),
            salted_pw_sha256: salted_password(ScramHash::Sha256, password.as_bytes(), &salt, iterations),
            salt,
            iteration_count: iterations,
            last_presence: None,
        }
    }

    /// Keep the cleartext password (required by DIGEST-MD5).
    pub fn with_cleartext(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Precomputed salted password for a SCRAM hash.
    pub fn salted_password(&self, hash: ScramHash) -> &[u8] {
        match hash {
            ScramHash::Sha1 => &self.salted_pw_sha1,
            ScramHash::Sha256 => &self.salted_pw_sha256,
        }
    }

    /// Check a cleartext password against the stored salted form.
    pub fn verify_password(&self, password: &str) -> bool {
        if self.salted_pw_sha256.is_empty() {
            return match &self.password {
                Some(stored) => constant_time_eq(stored.as_bytes(), password.as_bytes()),
                None => false,
            };
        }
        let candidate = salted_password(
            ScramHash::Sha256,
            password.as_bytes(),
            &self.salt,
            self.iteration_count,
        );
        constant_time_eq(&candidate, &self.salted_pw_sha256)
    }
}

/// Constant-time byte comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Account storage.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, RepositoryError>;

    async fn upsert_user(&self, user: &User) -> Result<(), RepositoryError>;

    async fn delete_user(&self, username: &str) -> Result<(), RepositoryError>;

    async fn user_exists(&self, username: &str) -> Result<bool, RepositoryError>;
}

/// In-memory [`UserRepository`].
#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    users: DashMap<String, User>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.users.get(username).map(|u| u.value().clone()))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), RepositoryError> {
        self.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<(), RepositoryError> {
        self.users.remove(username);
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, RepositoryError> {
        Ok(self.users.contains_key(username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_password() {
        let user = User::with_password("mariana", "1234", 1024);
        assert_eq!(user.salted_pw_sha1.len(), 20);
        assert_eq!(user.salted_pw_sha256.len(), 32);
        assert!(user.verify_password("1234"));
        assert!(!user.verify_password("12345"));
    }

    #[test]
    fn test_user_serde_roundtrip() {
        let mut user = User::with_password("ortuman", "secret", 4096).with_cleartext("secret");
        user.last_presence = Some("<presence from='ortuman@jackal.im/yard'/>".to_string());

        let json = serde_json::to_string(&user).unwrap();
        let decoded: User = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, user);
    }

    #[tokio::test]
    async fn test_memory_repository() {
        let repo = MemoryUserRepository::new();
        assert!(!repo.user_exists("mariana").await.unwrap());

        repo.upsert_user(&User::with_password("mariana", "1234", 1024))
            .await
            .unwrap();
        assert!(repo.user_exists("mariana").await.unwrap());
        assert_eq!(
            repo.fetch_user("mariana").await.unwrap().map(|u| u.username),
            Some("mariana".to_string())
        );

        repo.delete_user("mariana").await.unwrap();
        assert!(repo.fetch_user("mariana").await.unwrap().is_none());
    }
}
