use std::sync::Arc;

use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{RegistrationError, Result};
use crate::identity::{IdentityError, IdentityStore, NewAccount};
use crate::models::ClaimField;

/// Uniqueness checks and account compensation shared by both registration
/// pipelines.
///
/// The `exists_by_*` lookups only shorten the common path; the identity
/// store's own constraint, surfaced through [`commit`](Self::commit), is
/// what actually decides a race.
#[derive(Clone)]
pub struct UniquenessGuard {
    identities: Arc<dyn IdentityStore>,
}

impl UniquenessGuard {
    pub fn new(identities: Arc<dyn IdentityStore>) -> Self {
        Self { identities }
    }

    /// Advisory check, in order email, phone, username; first hit wins.
    pub async fn precheck(&self, email: &str, phone_number: Option<&str>, username: Option<&str>) -> Result<()> {
        self.ensure_free(ClaimField::Email, email).await?;
        if let Some(phone) = phone_number {
            self.ensure_free(ClaimField::PhoneNumber, phone).await?;
        }
        if let Some(username) = username {
            self.ensure_free(ClaimField::Username, username).await?;
        }
        Ok(())
    }

    /// Re-check immediately before commit, on email and phone.
    pub async fn recheck(&self, email: &str, phone_number: Option<&str>) -> Result<()> {
        self.precheck(email, phone_number, None).await
    }

    async fn ensure_free(&self, field: ClaimField, value: &str) -> Result<()> {
        let taken = match field {
            ClaimField::Email => self.identities.exists_by_email(value).await,
            ClaimField::PhoneNumber => self.identities.exists_by_phone(value).await,
            ClaimField::Username => self.identities.exists_by_username(value).await,
        }
        .map_err(|e| {
            error!(field = %field, "Uniqueness check failed: {}", e);
            RegistrationError::Unavailable(e.to_string())
        })?;

        if taken {
            warn!(field = %field, "Registration claim already in use");
            return Err(RegistrationError::DuplicateClaim(field));
        }
        Ok(())
    }

    /// Creates the account and returns its id; a store-level violation is a
    /// `DuplicateClaim`.
    pub async fn commit(&self, account: NewAccount) -> Result<Uuid> {
        self.identities.create(account).await.map_err(|e| match e {
            IdentityError::UniqueViolation(field) => {
                warn!(field = %field, "Identity store rejected duplicate claim");
                RegistrationError::DuplicateClaim(field)
            }
            other => {
                error!("Account creation failed: {}", other);
                RegistrationError::AccountCreationFailed(other.to_string())
            }
        })
    }

    /// Removes an account created earlier in a failed flow.
    pub async fn remove_account(&self, account_id: Uuid) {
        if let Err(e) = self.identities.delete_account(account_id).await {
            error!(account_id = %account_id, "Failed to remove account during compensation: {}", e);
        }
    }
}
