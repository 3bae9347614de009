//! Registration error taxonomy.
//!
//! Every coordinator operation reports one of these. Collaborator errors
//! ([`StoreError`](crate::session::StoreError),
//! [`CodeError`](crate::otp::CodeError),
//! [`IdentityError`](crate::identity::IdentityError)) are translated into
//! this set at the coordinator boundary.

use std::fmt;

use thiserror::Error;

use crate::models::ClaimField;
use crate::registration::payload::ValidationError;

/// Why the one-time-code service refused a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRejection {
    WrongCode,
    Expired,
    UnknownTicket,
    TooManyAttempts,
}

impl fmt::Display for CodeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeRejection::WrongCode => f.write_str("invalid verification code"),
            CodeRejection::Expired => f.write_str("verification code has expired"),
            CodeRejection::UnknownTicket => f.write_str("verification code not found"),
            CodeRejection::TooManyAttempts => {
                f.write_str("too many incorrect attempts for this verification code")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Caller error, reported before any side effect.
    #[error("{0}")]
    ValidationFailed(#[from] ValidationError),

    /// Another account already holds this claim.
    #[error("{0} is already in use")]
    DuplicateClaim(ClaimField),

    #[error("failed to persist registration session: {0}")]
    SessionPersistFailed(String),

    #[error("failed to issue verification code: {0}")]
    CodeIssuanceFailed(String),

    /// Absent, expired or already consumed; the three are not distinguished.
    #[error("registration session expired or invalid")]
    SessionNotFound,

    #[error("{0}")]
    CodeRejected(CodeRejection),

    #[error("failed to create account: {0}")]
    AccountCreationFailed(String),

    #[error("too many verification attempts, try again later")]
    TooManyAttempts,

    #[error("email address is already verified")]
    AlreadyVerified,

    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
}

impl RegistrationError {
    /// Whether this error comes from infrastructure rather than the caller.
    /// Such errors are reported opaquely.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            RegistrationError::SessionPersistFailed(_)
                | RegistrationError::CodeIssuanceFailed(_)
                | RegistrationError::AccountCreationFailed(_)
                | RegistrationError::Unavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
