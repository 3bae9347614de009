//! Enterprise/operator registration.
//!
//! Same shape as the self-service flow but keyed by the durable account id:
//! the account is created unverified up front, and a pending record under
//! `enterprise_registration:<account id>` tracks the verification window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::guard::UniquenessGuard;
use super::payload::{self, EnterpriseSignup};
use super::{issue_error, resend_error, verify_error, Collaborators, CompletedRegistration, ResentCode};
use crate::config::RegistrationConfig;
use crate::error::{RegistrationError, Result};
use crate::identity::{AccountRecord, NewAccount};
use crate::models::{AccountClass, ClientFingerprint};
use crate::session::{ExpiringRecord, SessionKey};

/// Pending verification window for an enterprise account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterprisePending {
    pub account_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExpiringRecord for EnterprisePending {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Verified,
    Expired,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnterprisePendingRegistration {
    pub account_id: Uuid,
    pub email: String,
    pub ticket_id: String,
    pub code_expires_at: DateTime<Utc>,
    pub resend_after: DateTime<Utc>,
}

pub struct EnterpriseRegistrar {
    deps: Collaborators,
    guard: UniquenessGuard,
    session_ttl: Duration,
    default_currency: String,
}

impl EnterpriseRegistrar {
    pub fn new(deps: Collaborators, config: &RegistrationConfig) -> Self {
        Self {
            guard: UniquenessGuard::new(deps.identities.clone()),
            deps,
            session_ttl: config.session_ttl(),
            default_currency: config.default_currency.clone(),
        }
    }

    pub async fn initiate(
        &self,
        signup: EnterpriseSignup,
        client: &ClientFingerprint,
    ) -> Result<EnterprisePendingRegistration> {
        let signup = signup.validate(&self.default_currency)?;

        self.reclaim_stale_account(&signup.email).await?;
        self.guard
            .precheck(&signup.email, signup.phone_number.as_deref(), None)
            .await?;

        let credential = self
            .deps
            .hasher
            .hash_blocking(signup.password)
            .await
            .map_err(|e| RegistrationError::AccountCreationFailed(e.to_string()))?;

        let account_id = self
            .guard
            .commit(NewAccount {
                email: signup.email.clone(),
                phone_number: signup.phone_number,
                username: None,
                profile: signup.profile,
                credential,
                class: AccountClass::Enterprise,
            })
            .await?;
        let key = SessionKey::Enterprise(account_id);

        let now = self.deps.clock.now();
        let pending = EnterprisePending {
            account_id,
            email: signup.email,
            created_at: now,
            expires_at: now + self.session_ttl,
        };

        if let Err(e) = self.deps.sessions.save(key, &pending).await {
            error!(account_id = %account_id, "Failed to persist enterprise registration: {}", e);
            self.guard.remove_account(account_id).await;
            return Err(RegistrationError::SessionPersistFailed(e.to_string()));
        }

        let ticket = match self.deps.codes.issue(&pending.email, client, account_id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!(account_id = %account_id, email = %pending.email, "Code issuance failed, removing account: {}", e);
                self.deps.sessions.discard_quietly(key).await;
                self.guard.remove_account(account_id).await;
                return Err(issue_error(e));
            }
        };

        info!(
            account_id = %account_id,
            email = %pending.email,
            ticket_id = %ticket.ticket_id,
            "Enterprise registration initiated"
        );

        Ok(EnterprisePendingRegistration {
            account_id,
            email: pending.email,
            ticket_id: ticket.ticket_id,
            code_expires_at: ticket.expires_at,
            resend_after: ticket.resend_after,
        })
    }

    pub async fn complete(&self, account_id: Uuid, code: &str, ticket_id: &str) -> Result<CompletedRegistration> {
        let key = SessionKey::Enterprise(account_id);
        let pending: EnterprisePending = self
            .deps
            .sessions
            .load(key)
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?
            .ok_or(RegistrationError::SessionNotFound)?;

        self.deps
            .codes
            .verify(&pending.email, code, ticket_id)
            .await
            .map_err(|e| {
                warn!(account_id = %account_id, ticket_id, "Verification code rejected: {}", e);
                verify_error(e)
            })?;

        self.deps
            .identities
            .set_email_verified(account_id, true)
            .await
            .map_err(|e| {
                error!(account_id = %account_id, "Failed to mark enterprise account verified: {}", e);
                RegistrationError::AccountCreationFailed(e.to_string())
            })?;

        self.deps.codes.confirm(&pending.email).await;
        self.deps.sessions.discard_quietly(key).await;
        info!(account_id = %account_id, email = %pending.email, "Enterprise registration completed");

        Ok(self.deps.completed(account_id).await)
    }

    pub async fn status(&self, account_id: Uuid) -> Result<RegistrationStatus> {
        let Some(account) = self.find_enterprise_account(account_id).await? else {
            return Ok(RegistrationStatus::NotFound);
        };
        if account.email_verified {
            return Ok(RegistrationStatus::Verified);
        }

        let pending = self
            .deps
            .sessions
            .contains(SessionKey::Enterprise(account_id))
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?;
        Ok(if pending {
            RegistrationStatus::Pending
        } else {
            RegistrationStatus::Expired
        })
    }

    pub async fn resend(&self, email: &str, client: &ClientFingerprint) -> Result<ResentCode> {
        let email = payload::normalize_email(email)?;
        let account = self
            .deps
            .identities
            .find_by_email(&email)
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?
            .filter(|account| account.class == AccountClass::Enterprise)
            .ok_or(RegistrationError::SessionNotFound)?;

        if account.email_verified {
            return Err(RegistrationError::AlreadyVerified);
        }
        let pending = self
            .deps
            .sessions
            .contains(SessionKey::Enterprise(account.account_id))
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?;
        if !pending {
            return Err(RegistrationError::SessionNotFound);
        }

        let ticket = self
            .deps
            .codes
            .resend(&email, client)
            .await
            .map_err(resend_error)?;
        info!(account_id = %account.account_id, ticket_id = %ticket.ticket_id, "Enterprise verification code resent");
        Ok(ticket.into())
    }

    async fn find_enterprise_account(&self, account_id: Uuid) -> Result<Option<AccountRecord>> {
        let account = self
            .deps
            .identities
            .find_account(account_id)
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?;
        Ok(account.filter(|account| account.class == AccountClass::Enterprise))
    }

    /// An unverified enterprise account whose window lapsed would otherwise
    /// hold its email forever.
    async fn reclaim_stale_account(&self, email: &str) -> Result<()> {
        let Some(account) = self
            .deps
            .identities
            .find_by_email(email)
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?
        else {
            return Ok(());
        };
        if account.class != AccountClass::Enterprise || account.email_verified {
            return Ok(());
        }

        let pending = self
            .deps
            .sessions
            .contains(SessionKey::Enterprise(account.account_id))
            .await
            .map_err(|e| RegistrationError::Unavailable(e.to_string()))?;
        if !pending {
            info!(account_id = %account.account_id, "Reclaiming lapsed enterprise registration");
            self.guard.remove_account(account.account_id).await;
        }
        Ok(())
    }
}
