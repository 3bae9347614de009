//! Outbound notifications.
//!
//! Verification codes are delivered synchronously by the code service;
//! welcome notices go through [`NotificationDispatcher`], which runs them as
//! detached tasks with bounded retries so a slow or failing relay never
//! affects a registration result.

pub mod mailer;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::models::ClientFingerprint;

pub use self::mailer::HttpMailer;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Everything a verification mail needs.
#[derive(Debug, Clone)]
pub struct VerificationCodeMessage {
    pub email: String,
    pub code: String,
    pub ticket_id: String,
    pub correlation_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub client: ClientFingerprint,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification_code(&self, message: &VerificationCodeMessage) -> Result<(), NotifyError>;

    async fn send_welcome(&self, email: &str, first_name: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them. The code itself
/// is never logged.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_verification_code(&self, message: &VerificationCodeMessage) -> Result<(), NotifyError> {
        info!(
            email = %message.email,
            ticket_id = %message.ticket_id,
            correlation_id = %message.correlation_id,
            expires_at = %message.expires_at,
            user_agent = %message.client.user_agent,
            ip_address = %message.client.ip_address,
            "Verification code ready for delivery"
        );
        Ok(())
    }

    async fn send_welcome(&self, email: &str, first_name: &str) -> Result<(), NotifyError> {
        info!(email = %email, "Welcome notice for {}", first_name);
        Ok(())
    }
}

/// Fire-and-forget delivery of post-registration notices.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    retry: RetryConfig,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, retry: RetryConfig) -> Self {
        Self { notifier, retry }
    }

    /// Sends a welcome notice in the background, retrying with exponential
    /// backoff. The handle is only useful to tests; callers drop it.
    pub fn dispatch_welcome(&self, email: String, first_name: String) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.initial_backoff();

        tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                match notifier.send_welcome(&email, &first_name).await {
                    Ok(()) => {
                        info!(email = %email, attempt, "Welcome notice sent");
                        return;
                    }
                    Err(e) => {
                        warn!(email = %email, attempt, "Welcome notice failed: {}", e);
                        if attempt < max_attempts {
                            tokio::time::sleep(backoff).await;
                            backoff = backoff.saturating_mul(2);
                        }
                    }
                }
            }
            error!(email = %email, max_attempts, "Giving up on welcome notice");
        })
    }
}
