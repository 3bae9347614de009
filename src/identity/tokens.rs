use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::IssuedCredentials;
use crate::clock::Clock;
use crate::config::TokenConfig;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Account ID
    pub kind: String, // "access" or "refresh"
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

/// Issues HS256 access/refresh token pairs.
#[derive(Clone)]
pub struct JwtTokenIssuer {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl JwtTokenIssuer {
    pub fn new(config: &TokenConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: config.secret.clone(),
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
            clock,
        }
    }

    pub fn issue(&self, account_id: Uuid) -> Result<IssuedCredentials, TokenError> {
        Ok(IssuedCredentials {
            access_token: self.sign(account_id, "access", self.access_ttl)?,
            refresh_token: self.sign(account_id, "refresh", self.refresh_ttl)?,
        })
    }

    fn sign(&self, account_id: Uuid, kind: &str, ttl: Duration) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = Claims {
            sub: account_id.to_string(),
            kind: kind.to_string(),
            jti: Uuid::new_v4().to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }
}
