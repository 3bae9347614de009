//! Durable identity store.
//!
//! The store is the single authority on uniqueness of email, phone number and
//! username. `exists_by_*` lookups are advisory; `create` must reject a
//! colliding claim atomically with [`IdentityError::UniqueViolation`].
//!
//! # Implementations
//! - [`InMemoryIdentityStore`]: one lock over the account map and its indexes
//! - [`DynamoDbIdentityStore`]: account item plus claim items in one transaction

pub mod dynamodb;
pub mod memory;
pub mod tokens;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AccountClass, ClaimField, CredentialHash, ProfileFields};

pub use self::dynamodb::DynamoDbIdentityStore;
pub use self::memory::InMemoryIdentityStore;
pub use self::tokens::{JwtTokenIssuer, TokenError};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("{0} is already in use")]
    UniqueViolation(ClaimField),

    #[error("account not found")]
    NotFound,

    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

impl From<TokenError> for IdentityError {
    fn from(err: TokenError) -> Self {
        IdentityError::Unavailable(err.to_string())
    }
}

/// An account about to be committed.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub phone_number: Option<String>,
    pub username: Option<String>,
    pub profile: ProfileFields,
    pub credential: CredentialHash,
    pub class: AccountClass,
}

/// A committed account as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: Uuid,
    pub email: String,
    pub phone_number: Option<String>,
    pub username: Option<String>,
    pub profile: ProfileFields,
    pub class: AccountClass,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn exists_by_email(&self, email: &str) -> Result<bool, IdentityError>;

    async fn exists_by_phone(&self, phone_number: &str) -> Result<bool, IdentityError>;

    async fn exists_by_username(&self, username: &str) -> Result<bool, IdentityError>;

    /// Commits `account` unverified and returns its id. Tokens are issued
    /// separately through [`issue_credentials`](Self::issue_credentials) so a
    /// token failure never hides a committed account.
    async fn create(&self, account: NewAccount) -> Result<Uuid, IdentityError>;

    async fn set_email_verified(&self, account_id: Uuid, verified: bool) -> Result<(), IdentityError>;

    async fn find_account(&self, account_id: Uuid) -> Result<Option<AccountRecord>, IdentityError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, IdentityError>;

    /// Removes an account and releases its claims. Missing accounts are not an error.
    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError>;

    async fn issue_credentials(&self, account_id: Uuid) -> Result<IssuedCredentials, IdentityError>;
}

/// Index key for a username; usernames collide case-insensitively.
pub(crate) fn username_key(username: &str) -> String {
    username.to_ascii_lowercase()
}
