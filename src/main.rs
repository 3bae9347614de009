//! Casino Registration Service
//!
//! Entry point for the registration HTTP service.
//!
//! # Flow
//! 1. Client submits a signup; the service validates it, holds it in the
//!    ephemeral store and mails a one-time code
//! 2. Client submits the code; the service verifies it and creates the account
//! 3. Client may ask for a fresh code while the signup is pending
//!
//! @author Joseph G Noonan
//! @copyright 2025

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use casino_registration::clock::{Clock, SystemClock};
use casino_registration::config::{
    CodeBackend, Config, EphemeralBackend, IdentityBackend, LoggingConfig, NotifierBackend,
};
use casino_registration::credential::CredentialHasher;
use casino_registration::http::{router, AppState};
use casino_registration::identity::{
    DynamoDbIdentityStore, IdentityStore, InMemoryIdentityStore, JwtTokenIssuer,
};
use casino_registration::notify::{HttpMailer, LogNotifier, NotificationDispatcher, Notifier};
use casino_registration::otp::{CodeService, LocalCodeService, TwilioCodeService};
use casino_registration::registration::Collaborators;
use casino_registration::session::{
    EphemeralStore, InMemoryEphemeralStore, RedisEphemeralStore, SessionStore,
};

/// Initializes the logging system.
///
/// Structured output with file, line and thread ids; JSON when configured.
/// `RUST_LOG` overrides the configured level.
///
/// # Arguments
/// * `config` - Logging section of the application configuration
///
/// # Returns
/// * `Result<()>` - Success or error if a subscriber is already installed
fn setup_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stdout);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.with_ansi(true).try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Builds the configured adapters and wires them into the router state.
///
/// Sets up the following components:
/// - Ephemeral session store (memory or Redis)
/// - Identity store (memory or DynamoDB) with the JWT issuer
/// - Notifier and one-time-code service
/// - Credential hasher
///
/// # Arguments
/// * `config` - Application configuration
/// * `clock` - Time source shared by every component
///
/// # Returns
/// * `Result<AppState>` - Router state or error if any backend fails to start
async fn setup_services(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<AppState> {
    let ephemeral: Arc<dyn EphemeralStore> = match config.ephemeral_store.backend {
        EphemeralBackend::Memory => {
            info!("Using in-memory session store");
            Arc::new(InMemoryEphemeralStore::new(clock.clone()))
        }
        EphemeralBackend::Redis => {
            let url = config
                .ephemeral_store
                .redis_url
                .as_deref()
                .context("ephemeral_store.redis_url is required")?;
            info!("Connecting to Redis session store...");
            Arc::new(RedisEphemeralStore::connect(url).await?)
        }
    };

    let tokens = JwtTokenIssuer::new(&config.tokens, clock.clone());
    let identities: Arc<dyn IdentityStore> = match config.identity_store.backend {
        IdentityBackend::Memory => {
            info!("Using in-memory identity store");
            Arc::new(InMemoryIdentityStore::new(tokens, clock.clone()))
        }
        IdentityBackend::DynamoDb => {
            info!("Initializing DynamoDB identity store...");
            Arc::new(DynamoDbIdentityStore::connect(&config.identity_store, tokens, clock.clone()).await?)
        }
    };

    let notifier: Arc<dyn Notifier> = match config.notifications.backend {
        NotifierBackend::Log => Arc::new(LogNotifier),
        NotifierBackend::Http => {
            let relay = &config.notifications.mail_relay;
            Arc::new(HttpMailer::new(
                relay.endpoint.clone().context("notifications.mail_relay.endpoint is required")?,
                relay.api_key.clone().context("notifications.mail_relay.api_key is required")?,
                relay.from.clone().context("notifications.mail_relay.from is required")?,
            )?)
        }
    };

    let codes: Arc<dyn CodeService> = match config.code_service.backend {
        CodeBackend::Local => {
            info!("Using local one-time-code service");
            Arc::new(LocalCodeService::new(
                &config.verification,
                &config.rate_limits,
                notifier.clone(),
                clock.clone(),
            )
            .with_pending_window(config.registration.session_ttl()))
        }
        CodeBackend::Twilio => {
            info!("Initializing Twilio Verify code service...");
            Arc::new(TwilioCodeService::new(
                &config.code_service.twilio,
                &config.verification,
                &config.rate_limits,
                clock.clone(),
            )?
            .with_pending_window(config.registration.session_ttl()))
        }
    };

    let deps = Collaborators {
        sessions: SessionStore::new(ephemeral, clock.clone()),
        codes,
        identities,
        notifications: NotificationDispatcher::new(notifier, config.notifications.retry.clone()),
        hasher: CredentialHasher::new(&config.password_hashing)?,
        clock,
    };

    Ok(AppState::new(deps, &config.registration, config.application.name.clone()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new().context("failed to load configuration")?;
    setup_logging(&config.logging)?;
    info!("Casino Registration Service starting up...");

    let state = setup_services(&config, Arc::new(SystemClock)).await?;
    let app = router(state);

    let addr = format!("{}:{}", config.server.endpoint, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
