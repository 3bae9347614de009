//! Configuration Module
//!
//! Provides configuration management for the registration service.
//! Handles loading and parsing of the YAML configuration file and environment
//! variables, and checks that every selected backend is fully configured.
//!
//! # Sources
//! Later sources override earlier ones:
//! 1. `config/application.yml`
//! 2. Environment variables prefixed with `APP_`, nested keys separated by
//!    `__` (for example `APP_TOKENS__SECRET`)

use std::time::Duration as StdDuration;

use chrono::Duration;
use config::{Config as ConfigFile, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application metadata configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Application {
    /// Name of the application
    pub name: String,
}

impl Default for Application {
    fn default() -> Self {
        Self {
            name: "casino-registration".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub endpoint: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Registration session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Lifetime of a pending signup in seconds
    pub session_ttl_secs: u64,
    /// Currency assigned when the signup names none
    pub default_currency: String,
}

impl RegistrationConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_secs as i64)
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            default_currency: "USD".to_string(),
        }
    }
}

/// One-time code configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Number of digits in a code
    pub code_length: u32,
    /// Code lifetime in seconds
    pub code_expiry_secs: u64,
    /// Minimum delay between two codes for the same email, in seconds
    pub resend_cooldown_secs: u64,
    /// Wrong submissions tolerated per ticket
    pub max_verify_attempts: u32,
}

impl VerificationConfig {
    pub fn code_expiry(&self) -> Duration {
        Duration::seconds(self.code_expiry_secs as i64)
    }

    pub fn resend_cooldown(&self) -> Duration {
        Duration::seconds(self.resend_cooldown_secs as i64)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            code_expiry_secs: 10 * 60,
            resend_cooldown_secs: 2 * 60,
            max_verify_attempts: 5,
        }
    }
}

/// Rate limiting configuration for code issuance
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimits {
    /// Codes allowed per email within one window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimits {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 60 * 60,
        }
    }
}

/// Argon2id parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PasswordHashingConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for PasswordHashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Access and refresh token configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC secret used to sign tokens
    pub secret: String,
    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds
    pub refresh_ttl_secs: u64,
}

impl TokenConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::seconds(self.access_ttl_secs as i64)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_ttl_secs as i64)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_ttl_secs: 60 * 60,
            refresh_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EphemeralBackend {
    #[default]
    Memory,
    Redis,
}

/// Ephemeral session store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EphemeralStoreConfig {
    pub backend: EphemeralBackend,
    /// Redis connection URL, required for the redis backend
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    #[default]
    Memory,
    DynamoDb,
}

/// Durable identity store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct IdentityStoreConfig {
    pub backend: IdentityBackend,
    /// DynamoDB table name
    pub table_name: Option<String>,
    /// AWS region
    pub region: Option<String>,
    /// DynamoDB endpoint (optional, for local development)
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodeBackend {
    #[default]
    Local,
    Twilio,
}

/// Twilio Verify configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TwilioConfig {
    /// Twilio account SID
    pub account_sid: Option<String>,
    /// Twilio auth token
    pub auth_token: Option<String>,
    /// Twilio verify service SID
    pub verify_service_sid: Option<String>,
    /// Override of the Verify API base URL
    pub base_url: Option<String>,
}

/// One-time code service configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CodeServiceConfig {
    pub backend: CodeBackend,
    pub twilio: TwilioConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifierBackend {
    #[default]
    Log,
    Http,
}

/// Mail relay configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MailRelayConfig {
    /// Relay endpoint accepting JSON messages
    pub endpoint: Option<String>,
    /// Bearer key for the relay
    pub api_key: Option<String>,
    /// Sender address
    pub from: Option<String>,
}

/// Retry policy for background notifications
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.initial_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NotificationConfig {
    pub backend: NotifierBackend,
    pub mail_relay: MailRelayConfig,
    pub retry: RetryConfig,
}

/// Application configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Application metadata
    pub application: Application,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Registration session configuration
    pub registration: RegistrationConfig,
    /// One-time code configuration
    pub verification: VerificationConfig,
    /// Rate limiting configuration
    pub rate_limits: RateLimits,
    /// Argon2id parameters
    pub password_hashing: PasswordHashingConfig,
    /// Token configuration
    pub tokens: TokenConfig,
    /// Ephemeral session store
    pub ephemeral_store: EphemeralStoreConfig,
    /// Durable identity store
    pub identity_store: IdentityStoreConfig,
    /// One-time code service
    pub code_service: CodeServiceConfig,
    /// Notification dispatcher
    pub notifications: NotificationConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Missing required config value: {0}")]
    MissingConfig(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl Config {
    /// Loads `config/application.yml` and the `APP_` environment overrides.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the sources cannot be parsed or a selected
    /// backend is missing required settings.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("config/application.yml")
    }

    /// Loads configuration from `path` (optional) plus environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let builder = ConfigFile::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document without consulting the environment.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = ConfigFile::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every selected backend has the settings it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.secret.trim().is_empty() {
            return Err(ConfigError::MissingConfig("tokens.secret".into()));
        }
        if self.registration.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "registration.session_ttl_secs must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("registration.session_ttl_secs", self.registration.session_ttl_secs),
            ("verification.code_expiry_secs", self.verification.code_expiry_secs),
            ("verification.resend_cooldown_secs", self.verification.resend_cooldown_secs),
            ("rate_limits.window_secs", self.rate_limits.window_secs),
            ("tokens.access_ttl_secs", self.tokens.access_ttl_secs),
            ("tokens.refresh_ttl_secs", self.tokens.refresh_ttl_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::InvalidValue(format!("{name} is out of range")));
            }
        }
        if !(4..=10).contains(&self.verification.code_length) {
            return Err(ConfigError::InvalidValue(
                "verification.code_length must be between 4 and 10".into(),
            ));
        }

        if self.ephemeral_store.backend == EphemeralBackend::Redis {
            require(&self.ephemeral_store.redis_url, "ephemeral_store.redis_url")?;
        }

        if self.identity_store.backend == IdentityBackend::DynamoDb {
            require(&self.identity_store.table_name, "identity_store.table_name")?;
            require(&self.identity_store.region, "identity_store.region")?;
        }

        if self.code_service.backend == CodeBackend::Twilio {
            let twilio = &self.code_service.twilio;
            require(&twilio.account_sid, "code_service.twilio.account_sid")?;
            require(&twilio.auth_token, "code_service.twilio.auth_token")?;
            require(
                &twilio.verify_service_sid,
                "code_service.twilio.verify_service_sid",
            )?;
        }

        if self.notifications.backend == NotifierBackend::Http {
            let relay = &self.notifications.mail_relay;
            require(&relay.endpoint, "notifications.mail_relay.endpoint")?;
            require(&relay.api_key, "notifications.mail_relay.api_key")?;
            require(&relay.from, "notifications.mail_relay.from")?;
        }

        Ok(())
    }
}

/// Upper bound for any configured duration (ten years).
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn require(value: &Option<String>, name: &str) -> Result<(), ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::MissingConfig(name.to_string())),
    }
}
