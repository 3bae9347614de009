//! One-time verification codes.
//!
//! A code is bound to an email address and a correlation id and identified
//! by an opaque ticket id. The coordinator only ever sees the ticket; the
//! code itself travels from the code service to the mailbox and back
//! through the client.
//!
//! Per-email resend state lives for the pending-signup window only; once it
//! lapses the email is unknown again and resend reports `NotFound`.
//!
//! # Implementations
//! - [`LocalCodeService`]: in-process engine delivering through a [`Notifier`](crate::notify::Notifier)
//! - [`TwilioCodeService`]: Twilio Verify, `email` channel

pub mod local;
pub mod rate_limit;
pub mod twilio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ClientFingerprint;

pub use self::local::LocalCodeService;
pub use self::rate_limit::RateLimiter;
pub use self::twilio::TwilioCodeService;

/// What the caller learns about an issued code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTicket {
    pub ticket_id: String,
    pub expires_at: DateTime<Utc>,
    /// Earliest instant a resend will be accepted.
    pub resend_after: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("invalid verification code")]
    WrongCode,

    #[error("verification code has expired")]
    Expired,

    #[error("no verification in progress")]
    NotFound,

    #[error("email address is already verified")]
    AlreadyVerified,

    #[error("too many attempts")]
    TooManyAttempts,

    #[error("code service unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeService: Send + Sync {
    /// Issues a fresh code for `email` and sends it.
    async fn issue(
        &self,
        email: &str,
        client: &ClientFingerprint,
        correlation_id: Uuid,
    ) -> Result<VerificationTicket, CodeError>;

    /// Checks `code` against the ticket; a matching code consumes the ticket.
    /// The email stays resendable until [`confirm`](Self::confirm).
    async fn verify(&self, email: &str, code: &str, ticket_id: &str) -> Result<(), CodeError>;

    /// Records that the account behind `email` was committed; later resends
    /// report `AlreadyVerified`.
    async fn confirm(&self, email: &str);

    /// Rotates the latest ticket for `email`, subject to the resend cooldown.
    async fn resend(&self, email: &str, client: &ClientFingerprint) -> Result<VerificationTicket, CodeError>;
}
