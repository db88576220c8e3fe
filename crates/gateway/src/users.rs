//! User records, credential storage and login
//!
//! The relational layer lives behind [`UserRepository`]; the service only
//! ever asks for "the user with this name" and compares password digests.

use async_trait::async_trait;

use crate::crypto::hash256;

/// Usernames: 3-20 word characters.
fn username_is_valid(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A stored user record. `password_hash` is the 64-char hex SHA-256 of the
/// user's password; plaintext never crosses this type.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UserError {
    #[error("username contains invalid symbols or has a bad length")]
    InvalidUsername,

    #[error("password hash does not have the expected format")]
    InvalidPasswordHash,
}

impl User {
    pub fn new(id: i64, username: &str, password_hash: &str) -> Result<Self, UserError> {
        if !username_is_valid(username) {
            return Err(UserError::InvalidUsername);
        }
        if password_hash.len() != 64 || !password_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UserError::InvalidPasswordHash);
        }
        Ok(Self {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
        })
    }
}

/// Narrow lookup boundary over whatever holds the user records. Any
/// backend failure is folded into "no result"; nothing propagates past
/// this trait.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> Option<User>;
}

/// Repository seeded from configuration. Stands where a SQL-backed
/// implementation would otherwise slot in behind the same trait.
pub struct ConfigUserRepository {
    users: Vec<User>,
}

impl ConfigUserRepository {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserRepository for ConfigUserRepository {
    async fn find_user_by_username(&self, username: &str) -> Option<User> {
        self.users.iter().find(|u| u.username == username).cloned()
    }
}

/// Login flow: fetch the record, hash the presented password, compare.
pub struct UserService {
    repository: Box<dyn UserRepository>,
}

impl UserService {
    pub fn new(repository: Box<dyn UserRepository>) -> Self {
        Self { repository }
    }

    /// Authenticate `username`/`password`; returns the owner identity on
    /// success. A missing user and a wrong password are indistinguishable
    /// to the caller.
    pub async fn log_in(&self, username: &str, password: &str) -> Option<String> {
        if !username_is_valid(username) {
            tracing::debug!(username, "login rejected: invalid username shape");
            return None;
        }

        let user = self.repository.find_user_by_username(username).await?;
        if hash256(password) != user.password_hash {
            tracing::debug!(username, "login rejected: bad credentials");
            return None;
        }

        Some(user.username)
    }
}
