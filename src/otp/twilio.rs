use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CodeError, CodeService, RateLimiter, VerificationTicket};
use crate::clock::Clock;
use crate::config::{RateLimits, RegistrationConfig, TwilioConfig, VerificationConfig};
use crate::models::ClientFingerprint;

const DEFAULT_BASE_URL: &str = "https://verify.twilio.com/v2";

#[derive(Debug, Serialize)]
struct VerificationRequest<'a> {
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "Channel")]
    channel: &'a str,
    #[serde(rename = "ChannelConfiguration")]
    channel_configuration: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    sid: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct VerificationCheckRequest<'a> {
    #[serde(rename = "VerificationSid")]
    verification_sid: &'a str,
    #[serde(rename = "Code")]
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerificationCheckResponse {
    status: String,
    to: String,
}

#[derive(Debug)]
struct EmailState {
    correlation_id: Uuid,
    resend_after: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    verified: bool,
}

/// Code service backed by Twilio Verify's `email` channel.
///
/// Twilio owns code generation, expiry and delivery. Resend cooldown and
/// per-email rate limiting are enforced here before Twilio is called.
pub struct TwilioCodeService {
    client: Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
    code_expiry: Duration,
    resend_cooldown: Duration,
    pending_window: Duration,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    emails: Mutex<HashMap<String, EmailState>>,
}

impl TwilioCodeService {
    pub fn new(
        config: &TwilioConfig,
        verification: &VerificationConfig,
        rate_limits: &RateLimits,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CodeError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()
            .map_err(|e| CodeError::Unavailable(e.to_string()))?;

        let service_sid = required(&config.verify_service_sid, "verify_service_sid")?;
        let base_url = format!(
            "{}/Services/{}/",
            config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/'),
            service_sid
        );

        Ok(Self {
            client,
            account_sid: required(&config.account_sid, "account_sid")?,
            auth_token: required(&config.auth_token, "auth_token")?,
            base_url,
            code_expiry: verification.code_expiry(),
            resend_cooldown: verification.resend_cooldown(),
            pending_window: RegistrationConfig::default().session_ttl(),
            limiter: RateLimiter::new(rate_limits, clock.clone()),
            clock,
            emails: Mutex::new(HashMap::new()),
        })
    }

    /// How long an email stays resendable after its first issue.
    pub fn with_pending_window(mut self, window: Duration) -> Self {
        self.pending_window = window;
        self
    }

    async fn start_verification(&self, email: &str, client: &ClientFingerprint) -> Result<VerificationTicket, CodeError> {
        let url = format!("{}Verifications", self.base_url);
        let channel_configuration = serde_json::json!({
            "substitutions": {
                "user_agent": client.user_agent,
                "ip_address": client.ip_address,
            }
        })
        .to_string();

        let request = VerificationRequest {
            to: email,
            channel: "email",
            channel_configuration,
        };

        let now = self.clock.now();
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&request)
            .send()
            .await
            .map_err(|e| CodeError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(CodeError::TooManyAttempts),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(email = %email, status = status.as_u16(), "Failed to start verification: {}", body);
                return Err(CodeError::Unavailable(format!("twilio returned {status}")));
            }
        }

        let verification: VerificationResponse = response
            .json()
            .await
            .map_err(|e| CodeError::Unavailable(e.to_string()))?;
        info!(
            email = %email,
            ticket_id = %verification.sid,
            status = %verification.status,
            "Started email verification"
        );

        Ok(VerificationTicket {
            ticket_id: verification.sid,
            expires_at: now + self.code_expiry,
            resend_after: now + self.resend_cooldown,
        })
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String, CodeError> {
    value
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CodeError::Unavailable(format!("twilio {name} is not configured")))
}

#[async_trait]
impl CodeService for TwilioCodeService {
    async fn issue(
        &self,
        email: &str,
        client: &ClientFingerprint,
        correlation_id: Uuid,
    ) -> Result<VerificationTicket, CodeError> {
        if !self.limiter.check_rate_limit(email).await {
            return Err(CodeError::TooManyAttempts);
        }

        let ticket = self.start_verification(email, client).await?;
        let now = self.clock.now();
        let mut emails = self.emails.lock().await;
        emails.retain(|_, e| now < e.expires_at);
        emails.insert(
            email.to_string(),
            EmailState {
                correlation_id,
                resend_after: ticket.resend_after,
                expires_at: now + self.pending_window,
                verified: false,
            },
        );
        Ok(ticket)
    }

    async fn verify(&self, email: &str, code: &str, ticket_id: &str) -> Result<(), CodeError> {
        let url = format!("{}VerificationCheck", self.base_url);
        let request = VerificationCheckRequest {
            verification_sid: ticket_id,
            code,
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&request)
            .send()
            .await
            .map_err(|e| CodeError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(CodeError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => return Err(CodeError::TooManyAttempts),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(ticket_id, status = status.as_u16(), "Failed to check verification: {}", body);
                return Err(CodeError::Unavailable(format!("twilio returned {status}")));
            }
        }

        let check: VerificationCheckResponse = response
            .json()
            .await
            .map_err(|e| CodeError::Unavailable(e.to_string()))?;

        if !check.to.eq_ignore_ascii_case(email) {
            warn!(ticket_id, "Verification ticket belongs to another address");
            return Err(CodeError::NotFound);
        }

        match check.status.as_str() {
            "approved" => {
                self.limiter.reset_rate_limit(email).await;
                info!(email = %email, ticket_id, "Verification code accepted");
                Ok(())
            }
            "pending" => Err(CodeError::WrongCode),
            "max_attempts_reached" => Err(CodeError::TooManyAttempts),
            _ => Err(CodeError::Expired),
        }
    }

    async fn resend(&self, email: &str, client: &ClientFingerprint) -> Result<VerificationTicket, CodeError> {
        let now = self.clock.now();
        let correlation_id = {
            let mut emails = self.emails.lock().await;
            let entry = emails.get(email).ok_or(CodeError::NotFound)?;
            if now >= entry.expires_at {
                emails.remove(email);
                return Err(CodeError::NotFound);
            }
            if entry.verified {
                return Err(CodeError::AlreadyVerified);
            }
            if now < entry.resend_after {
                return Err(CodeError::TooManyAttempts);
            }
            entry.correlation_id
        };

        if !self.limiter.check_rate_limit(email).await {
            return Err(CodeError::TooManyAttempts);
        }

        let ticket = self.start_verification(email, client).await?;
        if let Some(entry) = self.emails.lock().await.get_mut(email) {
            entry.resend_after = ticket.resend_after;
        }
        info!(email = %email, correlation_id = %correlation_id, "Resent verification code");
        Ok(ticket)
    }

    async fn confirm(&self, email: &str) {
        if let Some(entry) = self.emails.lock().await.get_mut(email) {
            entry.verified = true;
        }
    }
}
