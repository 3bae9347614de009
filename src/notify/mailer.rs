use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

use super::{NotifyError, Notifier, VerificationCodeMessage};

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a str,
    template: &'a str,
    variables: serde_json::Value,
}

/// Sends mail through an HTTP relay that renders named templates.
pub struct HttpMailer {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: String, api_key: String, from: String) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            from,
        })
    }

    async fn send(&self, to: &str, template: &str, variables: serde_json::Value) -> Result<(), NotifyError> {
        let request = MailRequest {
            from: &self.from,
            to,
            template,
            variables,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(to = %to, template, status = status.as_u16(), "Mail relay rejected message");
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(to = %to, template, "Mail relay accepted message");
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn send_verification_code(&self, message: &VerificationCodeMessage) -> Result<(), NotifyError> {
        let variables = serde_json::json!({
            "code": message.code,
            "expires_at": message.expires_at.to_rfc3339(),
            "user_agent": message.client.user_agent,
            "ip_address": message.client.ip_address,
        });
        self.send(&message.email, "email_verification", variables).await
    }

    async fn send_welcome(&self, email: &str, first_name: &str) -> Result<(), NotifyError> {
        let variables = serde_json::json!({ "first_name": first_name });
        self.send(email, "welcome", variables).await
    }
}
