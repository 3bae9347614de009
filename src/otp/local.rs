use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CodeError, CodeService, RateLimiter, VerificationTicket};
use crate::clock::Clock;
use crate::config::{RateLimits, RegistrationConfig, VerificationConfig};
use crate::models::ClientFingerprint;
use crate::notify::{Notifier, VerificationCodeMessage};

#[derive(Debug)]
struct Ticket {
    email: String,
    code: String,
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
}

/// Per-email bookkeeping for resend, dropped once the signup window lapses.
#[derive(Debug)]
struct EmailState {
    latest_ticket: Option<String>,
    correlation_id: Uuid,
    resend_after: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    verified: bool,
}

#[derive(Debug, Default)]
struct State {
    tickets: HashMap<String, Ticket>,
    emails: HashMap<String, EmailState>,
}

/// In-process one-time-code engine.
///
/// Independent issues for the same email yield independent tickets, each
/// verifiable on its own. Resend supersedes only the latest one.
pub struct LocalCodeService {
    code_length: u32,
    code_expiry: Duration,
    resend_cooldown: Duration,
    max_attempts: u32,
    pending_window: Duration,
    limiter: RateLimiter,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl LocalCodeService {
    pub fn new(
        config: &VerificationConfig,
        rate_limits: &RateLimits,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            code_length: config.code_length,
            code_expiry: config.code_expiry(),
            resend_cooldown: config.resend_cooldown(),
            max_attempts: config.max_verify_attempts,
            pending_window: RegistrationConfig::default().session_ttl(),
            limiter: RateLimiter::new(rate_limits, clock.clone()),
            notifier,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// How long an email stays resendable after its first issue; match it to
    /// the registration session TTL.
    pub fn with_pending_window(mut self, window: Duration) -> Self {
        self.pending_window = window;
        self
    }

    fn generate_code(&self) -> String {
        let upper = 10u64.pow(self.code_length);
        let code = OsRng.gen_range(0..upper);
        format!("{code:0>width$}", width = self.code_length as usize)
    }

    /// Stores a new ticket and returns it with the code to deliver.
    async fn store_ticket(&self, email: &str, correlation_id: Uuid, supersede: bool) -> (VerificationTicket, String) {
        let now = self.clock.now();
        let code = self.generate_code();
        let ticket_id = Uuid::new_v4().to_string();
        let ticket = VerificationTicket {
            ticket_id: ticket_id.clone(),
            expires_at: now + self.code_expiry,
            resend_after: now + self.resend_cooldown,
        };

        let mut state = self.state.lock().await;
        state.tickets.retain(|_, t| now < t.expires_at);
        state.emails.retain(|_, e| now < e.expires_at);

        // A resend rotates the ticket but never extends the signup window.
        let mut expires_at = now + self.pending_window;
        if supersede {
            if let Some(entry) = state.emails.get(email) {
                expires_at = entry.expires_at;
                if let Some(previous) = entry.latest_ticket.clone() {
                    state.tickets.remove(&previous);
                }
            }
        }

        state.tickets.insert(
            ticket_id.clone(),
            Ticket {
                email: email.to_string(),
                code: code.clone(),
                expires_at: ticket.expires_at,
                failed_attempts: 0,
            },
        );
        state.emails.insert(
            email.to_string(),
            EmailState {
                latest_ticket: Some(ticket_id),
                correlation_id,
                resend_after: ticket.resend_after,
                expires_at,
                verified: false,
            },
        );

        (ticket, code)
    }

    async fn deliver(&self, email: &str, code: String, ticket: &VerificationTicket, correlation_id: Uuid, client: &ClientFingerprint) {
        let message = VerificationCodeMessage {
            email: email.to_string(),
            code,
            ticket_id: ticket.ticket_id.clone(),
            correlation_id,
            expires_at: ticket.expires_at,
            client: client.clone(),
        };

        if let Err(e) = self.notifier.send_verification_code(&message).await {
            error!(
                email = %email,
                ticket_id = %ticket.ticket_id,
                "Failed to deliver verification code: {}",
                e
            );
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn codes_match(expected: &str, submitted: &str) -> bool {
    expected.len() == submitted.len()
        && expected
            .bytes()
            .zip(submitted.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[async_trait]
impl CodeService for LocalCodeService {
    async fn issue(
        &self,
        email: &str,
        client: &ClientFingerprint,
        correlation_id: Uuid,
    ) -> Result<VerificationTicket, CodeError> {
        if !self.limiter.check_rate_limit(email).await {
            return Err(CodeError::TooManyAttempts);
        }

        let (ticket, code) = self.store_ticket(email, correlation_id, false).await;
        info!(
            email = %email,
            ticket_id = %ticket.ticket_id,
            correlation_id = %correlation_id,
            "Issued verification code"
        );

        self.deliver(email, code, &ticket, correlation_id, client).await;
        Ok(ticket)
    }

    async fn verify(&self, email: &str, code: &str, ticket_id: &str) -> Result<(), CodeError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let ticket = match state.tickets.get_mut(ticket_id) {
            Some(ticket) if ticket.email == email => ticket,
            _ => return Err(CodeError::NotFound),
        };

        if now >= ticket.expires_at {
            state.tickets.remove(ticket_id);
            return Err(CodeError::Expired);
        }
        if ticket.failed_attempts >= self.max_attempts {
            return Err(CodeError::TooManyAttempts);
        }
        if !codes_match(&ticket.code, code) {
            ticket.failed_attempts += 1;
            debug!(
                ticket_id,
                failed_attempts = ticket.failed_attempts,
                "Wrong verification code"
            );
            return Err(CodeError::WrongCode);
        }

        state.tickets.remove(ticket_id);
        if let Some(entry) = state.emails.get_mut(email) {
            if entry.latest_ticket.as_deref() == Some(ticket_id) {
                entry.latest_ticket = None;
            }
        }
        drop(state);

        self.limiter.reset_rate_limit(email).await;
        info!(email = %email, ticket_id, "Verification code accepted");
        Ok(())
    }

    async fn resend(&self, email: &str, client: &ClientFingerprint) -> Result<VerificationTicket, CodeError> {
        let now = self.clock.now();
        let correlation_id = {
            let mut state = self.state.lock().await;
            let entry = state.emails.get(email).ok_or(CodeError::NotFound)?;
            if now >= entry.expires_at {
                state.emails.remove(email);
                debug!(email = %email, "Resend requested after the signup window lapsed");
                return Err(CodeError::NotFound);
            }
            if entry.verified {
                return Err(CodeError::AlreadyVerified);
            }
            if now < entry.resend_after {
                warn!(email = %email, resend_after = %entry.resend_after, "Resend requested during cooldown");
                return Err(CodeError::TooManyAttempts);
            }
            entry.correlation_id
        };

        if !self.limiter.check_rate_limit(email).await {
            return Err(CodeError::TooManyAttempts);
        }

        let (ticket, code) = self.store_ticket(email, correlation_id, true).await;
        info!(
            email = %email,
            ticket_id = %ticket.ticket_id,
            correlation_id = %correlation_id,
            "Resent verification code"
        );

        self.deliver(email, code, &ticket, correlation_id, client).await;
        Ok(ticket)
    }

    async fn confirm(&self, email: &str) {
        if let Some(entry) = self.state.lock().await.emails.get_mut(email) {
            entry.verified = true;
            entry.latest_ticket = None;
        }
    }
}
