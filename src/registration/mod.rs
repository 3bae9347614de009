//! Registration coordinator.
//!
//! Two-phase self-service signup: `initiate` validates the payload, writes a
//! pending [`RegistrationSession`] to the ephemeral store and asks the code
//! service for a verification code; `complete` verifies the code, re-checks
//! uniqueness and commits the durable account. Nothing durable exists before
//! a code has been verified.
//!
//! # Features
//! - Advisory uniqueness pre-check, authoritative re-check plus store constraint
//! - Compensation of the pending session when code issuance fails
//! - Resend keyed by email, delegated to the code service
//! - Fire-and-forget welcome notice after commit
//!
//! The enterprise variant lives in [`enterprise`] and shares the guard.

pub mod enterprise;
pub mod guard;
pub mod payload;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RegistrationConfig;
use crate::credential::CredentialHasher;
use crate::error::{CodeRejection, RegistrationError, Result};
use crate::identity::{IdentityStore, NewAccount};
use crate::models::{AccountClass, ClientFingerprint};
use crate::notify::NotificationDispatcher;
use crate::otp::{CodeError, CodeService, VerificationTicket};
use crate::session::{RegistrationSession, SessionKey, SessionStore};

pub use self::enterprise::{EnterpriseRegistrar, RegistrationStatus};
pub use self::guard::UniquenessGuard;
pub use self::payload::{EnterpriseSignup, SignupPayload, ValidationError};

/// Everything both registration pipelines depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: SessionStore,
    pub codes: Arc<dyn CodeService>,
    pub identities: Arc<dyn IdentityStore>,
    pub notifications: NotificationDispatcher,
    pub hasher: CredentialHasher,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRegistration {
    pub session_id: Uuid,
    pub email: String,
    pub ticket_id: String,
    pub code_expires_at: DateTime<Utc>,
    pub resend_after: DateTime<Utc>,
}

/// Tokens are absent when the account committed but token issuance failed;
/// the client signs in normally instead.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedRegistration {
    pub account_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub is_new_account: bool,
}

impl Collaborators {
    /// Issues tokens for a committed account. A failure is logged and never
    /// reported as a failed registration.
    async fn completed(&self, account_id: Uuid) -> CompletedRegistration {
        let (access_token, refresh_token) = match self.identities.issue_credentials(account_id).await {
            Ok(credentials) => (Some(credentials.access_token), Some(credentials.refresh_token)),
            Err(e) => {
                warn!(account_id = %account_id, "Account committed but tokens could not be issued: {}", e);
                (None, None)
            }
        };
        CompletedRegistration {
            account_id,
            access_token,
            refresh_token,
            is_new_account: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResentCode {
    pub ticket_id: String,
    pub code_expires_at: DateTime<Utc>,
    pub resend_after: DateTime<Utc>,
}

impl From<VerificationTicket> for ResentCode {
    fn from(ticket: VerificationTicket) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            code_expires_at: ticket.expires_at,
            resend_after: ticket.resend_after,
        }
    }
}

pub struct RegistrationCoordinator {
    deps: Collaborators,
    guard: UniquenessGuard,
    session_ttl: Duration,
    default_currency: String,
}

impl RegistrationCoordinator {
    pub fn new(deps: Collaborators, config: &RegistrationConfig) -> Self {
        Self {
            guard: UniquenessGuard::new(deps.identities.clone()),
            deps,
            session_ttl: config.session_ttl(),
            default_currency: config.default_currency.clone(),
        }
    }

    /// Starts a signup. Returns the session id the client completes with.
    pub async fn initiate(&self, payload: SignupPayload, client: &ClientFingerprint) -> Result<PendingRegistration> {
        let signup = payload.validate(&self.default_currency)?;

        self.guard
            .precheck(
                &signup.email,
                Some(&signup.phone_number),
                signup.username.as_deref(),
            )
            .await?;

        let credential = self
            .deps
            .hasher
            .hash_blocking(signup.password)
            .await
            .map_err(|e| {
                error!(email = %signup.email, "Failed to hash credential: {}", e);
                RegistrationError::SessionPersistFailed(e.to_string())
            })?;

        let now = self.deps.clock.now();
        let session = RegistrationSession {
            id: Uuid::new_v4(),
            email: signup.email,
            phone_number: signup.phone_number,
            username: signup.username,
            profile: signup.profile,
            credential,
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        let key = session.key();

        self.deps.sessions.save(key, &session).await.map_err(|e| {
            error!(session_id = %session.id, "Failed to persist registration session: {}", e);
            RegistrationError::SessionPersistFailed(e.to_string())
        })?;

        let ticket = match self.deps.codes.issue(&session.email, client, session.id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!(session_id = %session.id, email = %session.email, "Code issuance failed, discarding session: {}", e);
                self.deps.sessions.discard_quietly(key).await;
                return Err(issue_error(e));
            }
        };

        info!(
            session_id = %session.id,
            email = %session.email,
            ticket_id = %ticket.ticket_id,
            "Registration initiated"
        );

        Ok(PendingRegistration {
            session_id: session.id,
            email: session.email,
            ticket_id: ticket.ticket_id,
            code_expires_at: ticket.expires_at,
            resend_after: ticket.resend_after,
        })
    }

    /// Verifies the code and commits the account.
    pub async fn complete(&self, session_id: Uuid, code: &str, ticket_id: &str) -> Result<CompletedRegistration> {
        let key = SessionKey::Registration(session_id);
        let session: RegistrationSession = self
            .deps
            .sessions
            .load(key)
            .await
            .map_err(|e| {
                error!(session_id = %session_id, "Failed to read registration session: {}", e);
                RegistrationError::Unavailable(e.to_string())
            })?
            .ok_or(RegistrationError::SessionNotFound)?;

        self.deps
            .codes
            .verify(&session.email, code, ticket_id)
            .await
            .map_err(|e| {
                warn!(session_id = %session_id, ticket_id, "Verification code rejected: {}", e);
                verify_error(e)
            })?;

        match self.guard.recheck(&session.email, Some(&session.phone_number)).await {
            Ok(()) => {}
            Err(e @ RegistrationError::DuplicateClaim(_)) => {
                self.deps.sessions.discard_quietly(key).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let first_name = session.profile.first_name.clone();
        let account = NewAccount {
            email: session.email.clone(),
            phone_number: Some(session.phone_number),
            username: session.username,
            profile: session.profile,
            credential: session.credential,
            class: AccountClass::SelfService,
        };

        let account_id = match self.guard.commit(account).await {
            Ok(account_id) => account_id,
            Err(e @ RegistrationError::DuplicateClaim(_)) => {
                self.deps.sessions.discard_quietly(key).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.deps.identities.set_email_verified(account_id, true).await {
            warn!(
                account_id = %account_id,
                "Account committed but email could not be marked verified: {}",
                e
            );
        }

        self.deps.codes.confirm(&session.email).await;
        self.deps.sessions.discard_quietly(key).await;
        self.deps
            .notifications
            .dispatch_welcome(session.email.clone(), first_name);

        info!(
            session_id = %session_id,
            account_id = %account_id,
            email = %session.email,
            "Registration completed"
        );

        Ok(self.deps.completed(account_id).await)
    }

    /// Asks for a fresh code for a pending signup. Sessions are not touched.
    pub async fn resend(&self, email: &str, client: &ClientFingerprint) -> Result<ResentCode> {
        let email = payload::normalize_email(email)?;
        let ticket = self
            .deps
            .codes
            .resend(&email, client)
            .await
            .map_err(resend_error)?;

        info!(email = %email, ticket_id = %ticket.ticket_id, "Verification code resent");
        Ok(ticket.into())
    }
}

fn issue_error(err: CodeError) -> RegistrationError {
    match err {
        CodeError::TooManyAttempts => RegistrationError::TooManyAttempts,
        other => RegistrationError::CodeIssuanceFailed(other.to_string()),
    }
}

fn verify_error(err: CodeError) -> RegistrationError {
    match err {
        CodeError::WrongCode => RegistrationError::CodeRejected(CodeRejection::WrongCode),
        CodeError::Expired => RegistrationError::CodeRejected(CodeRejection::Expired),
        CodeError::NotFound | CodeError::AlreadyVerified => {
            RegistrationError::CodeRejected(CodeRejection::UnknownTicket)
        }
        CodeError::TooManyAttempts => RegistrationError::CodeRejected(CodeRejection::TooManyAttempts),
        CodeError::Unavailable(reason) => RegistrationError::Unavailable(reason),
    }
}

fn resend_error(err: CodeError) -> RegistrationError {
    match err {
        CodeError::NotFound => RegistrationError::SessionNotFound,
        CodeError::AlreadyVerified => RegistrationError::AlreadyVerified,
        CodeError::TooManyAttempts => RegistrationError::TooManyAttempts,
        other => RegistrationError::CodeIssuanceFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PasswordHashingConfig, RetryConfig, TokenConfig};
    use crate::identity::{
        IdentityError, InMemoryIdentityStore, IssuedCredentials, JwtTokenIssuer, MockIdentityStore,
    };
    use crate::models::ClaimField;
    use crate::notify::LogNotifier;
    use crate::otp::MockCodeService;
    use crate::session::{EphemeralStore, InMemoryEphemeralStore};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: InMemoryEphemeralStore,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let store = InMemoryEphemeralStore::new(clock.clone());
            Self { clock, store }
        }

        fn coordinator(&self, codes: MockCodeService, identities: Arc<dyn IdentityStore>) -> RegistrationCoordinator {
            let hasher = CredentialHasher::new(&PasswordHashingConfig {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
            })
            .unwrap();
            let deps = Collaborators {
                sessions: SessionStore::new(Arc::new(self.store.clone()), self.clock.clone()),
                codes: Arc::new(codes),
                identities,
                notifications: NotificationDispatcher::new(Arc::new(LogNotifier), RetryConfig::default()),
                hasher,
                clock: self.clock.clone(),
            };
            RegistrationCoordinator::new(deps, &RegistrationConfig::default())
        }

        fn memory_identities(&self) -> Arc<InMemoryIdentityStore> {
            let tokens = JwtTokenIssuer::new(
                &TokenConfig {
                    secret: "test-secret".into(),
                    ..Default::default()
                },
                self.clock.clone(),
            );
            Arc::new(InMemoryIdentityStore::new(tokens, self.clock.clone()))
        }
    }

    fn payload() -> SignupPayload {
        SignupPayload {
            email: "a@x.com".into(),
            phone_number: "+100".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            password: "Zk9!mQ2#rT".into(),
            ..Default::default()
        }
    }

    fn client() -> ClientFingerprint {
        ClientFingerprint::new("test-agent", "127.0.0.1")
    }

    fn ticket(clock: &ManualClock) -> VerificationTicket {
        VerificationTicket {
            ticket_id: "t-1".into(),
            expires_at: clock.now() + Duration::minutes(10),
            resend_after: clock.now() + Duration::minutes(2),
        }
    }

    fn accepting_codes(clock: &ManualClock) -> MockCodeService {
        let issued = ticket(clock);
        let mut codes = MockCodeService::new();
        codes
            .expect_issue()
            .returning(move |_, _, _| Ok(issued.clone()));
        codes.expect_verify().returning(|_, _, _| Ok(()));
        codes.expect_confirm().returning(|_| ());
        codes
    }

    #[tokio::test]
    async fn issuance_failure_discards_the_session() {
        let fx = Fixture::new();
        let mut codes = MockCodeService::new();
        codes
            .expect_issue()
            .times(1)
            .returning(|_, _, _| Err(CodeError::Unavailable("smtp relay down".into())));
        codes.expect_verify().never();

        let coordinator = fx.coordinator(codes, fx.memory_identities());
        let err = coordinator.initiate(payload(), &client()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::CodeIssuanceFailed(_)));
        assert_eq!(fx.store.stored_entries().await, 0);
    }

    #[tokio::test]
    async fn session_holds_a_hash_not_the_password() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(accepting_codes(&fx.clock), fx.memory_identities());

        let pending = coordinator.initiate(payload(), &client()).await.unwrap();
        let raw = fx
            .store
            .get(&SessionKey::Registration(pending.session_id).to_string())
            .await
            .unwrap()
            .unwrap();

        assert!(!raw.contains("Zk9!mQ2#rT"));
        assert!(raw.contains("$argon2id$"));
        assert_eq!(pending.email, "a@x.com");
        assert_eq!(pending.ticket_id, "t-1");
    }

    #[tokio::test]
    async fn rejected_code_keeps_the_session() {
        let fx = Fixture::new();
        let issued = ticket(&fx.clock);
        let mut codes = MockCodeService::new();
        codes.expect_issue().returning(move |_, _, _| Ok(issued.clone()));
        codes
            .expect_verify()
            .returning(|_, _, _| Err(CodeError::WrongCode));

        let identities = fx.memory_identities();
        let coordinator = fx.coordinator(codes, identities.clone());
        let pending = coordinator.initiate(payload(), &client()).await.unwrap();

        let err = coordinator
            .complete(pending.session_id, "000000", &pending.ticket_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::CodeRejected(CodeRejection::WrongCode)
        ));
        assert_eq!(fx.store.stored_entries().await, 1);
        assert_eq!(identities.account_count().await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn verified_flag_failure_does_not_roll_back() {
        let fx = Fixture::new();
        let account_id = Uuid::new_v4();

        let mut identities = MockIdentityStore::new();
        identities.expect_exists_by_email().returning(|_| Ok(false));
        identities.expect_exists_by_phone().returning(|_| Ok(false));
        identities.expect_exists_by_username().returning(|_| Ok(false));
        identities.expect_create().times(1).returning(move |_| Ok(account_id));
        identities
            .expect_set_email_verified()
            .times(1)
            .returning(|_, _| Err(IdentityError::Unavailable("write timeout".into())));
        identities.expect_issue_credentials().returning(|_| {
            Ok(IssuedCredentials {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
            })
        });
        identities.expect_delete_account().never();

        let coordinator = fx.coordinator(accepting_codes(&fx.clock), Arc::new(identities));
        let pending = coordinator.initiate(payload(), &client()).await.unwrap();
        let completed = coordinator
            .complete(pending.session_id, "123456", &pending.ticket_id)
            .await
            .unwrap();

        assert_eq!(completed.account_id, account_id);
        assert_eq!(completed.access_token.as_deref(), Some("access"));
        assert!(completed.is_new_account);
        assert_eq!(fx.store.stored_entries().await, 0);
    }

    #[tokio::test]
    async fn token_failure_still_reports_the_committed_account() {
        let fx = Fixture::new();
        let account_id = Uuid::new_v4();

        let mut identities = MockIdentityStore::new();
        identities.expect_exists_by_email().returning(|_| Ok(false));
        identities.expect_exists_by_phone().returning(|_| Ok(false));
        identities.expect_create().times(1).returning(move |_| Ok(account_id));
        identities.expect_set_email_verified().times(1).returning(|_, _| Ok(()));
        identities
            .expect_issue_credentials()
            .times(1)
            .returning(|_| Err(IdentityError::Unavailable("signing key missing".into())));

        let coordinator = fx.coordinator(accepting_codes(&fx.clock), Arc::new(identities));
        let pending = coordinator.initiate(payload(), &client()).await.unwrap();
        let completed = coordinator
            .complete(pending.session_id, "123456", &pending.ticket_id)
            .await
            .unwrap();

        assert_eq!(completed.account_id, account_id);
        assert_eq!(completed.access_token, None);
        assert_eq!(fx.store.stored_entries().await, 0);
        assert_eq!(
            serde_json::to_value(&completed).unwrap(),
            serde_json::json!({"account_id": account_id, "is_new_account": true})
        );
    }

    #[tokio::test]
    async fn store_level_violation_is_a_duplicate_claim() {
        let fx = Fixture::new();

        let mut identities = MockIdentityStore::new();
        identities.expect_exists_by_email().returning(|_| Ok(false));
        identities.expect_exists_by_phone().returning(|_| Ok(false));
        identities
            .expect_create()
            .times(1)
            .returning(|_| Err(IdentityError::UniqueViolation(ClaimField::Email)));
        identities.expect_set_email_verified().never();

        let coordinator = fx.coordinator(accepting_codes(&fx.clock), Arc::new(identities));
        let pending = coordinator.initiate(payload(), &client()).await.unwrap();
        let err = coordinator
            .complete(pending.session_id, "123456", &pending.ticket_id)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistrationError::DuplicateClaim(ClaimField::Email)));
        assert_eq!(fx.store.stored_entries().await, 0);
    }

    #[tokio::test]
    async fn commit_failure_keeps_the_session() {
        let fx = Fixture::new();

        let mut identities = MockIdentityStore::new();
        identities.expect_exists_by_email().returning(|_| Ok(false));
        identities.expect_exists_by_phone().returning(|_| Ok(false));
        identities
            .expect_create()
            .returning(|_| Err(IdentityError::Unavailable("connection reset".into())));

        let issued = ticket(&fx.clock);
        let mut codes = MockCodeService::new();
        codes.expect_issue().returning(move |_, _, _| Ok(issued.clone()));
        codes.expect_verify().returning(|_, _, _| Ok(()));
        codes.expect_confirm().never();

        let coordinator = fx.coordinator(codes, Arc::new(identities));
        let pending = coordinator.initiate(payload(), &client()).await.unwrap();
        let err = coordinator
            .complete(pending.session_id, "123456", &pending.ticket_id)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistrationError::AccountCreationFailed(_)));
        assert_eq!(fx.store.stored_entries().await, 1);
    }

    #[tokio::test]
    async fn resend_outcomes_map_onto_registration_errors() {
        let fx = Fixture::new();
        let rotated = ticket(&fx.clock);
        let mut codes = MockCodeService::new();
        let mut calls = 0;
        codes
            .expect_resend()
            .withf(|email, _| email == "a@x.com")
            .returning(move |_, _| {
                calls += 1;
                match calls {
                    1 => Ok(rotated.clone()),
                    2 => Err(CodeError::TooManyAttempts),
                    3 => Err(CodeError::NotFound),
                    _ => Err(CodeError::AlreadyVerified),
                }
            });

        let coordinator = fx.coordinator(codes, fx.memory_identities());
        let resent = coordinator.resend(" A@x.com", &client()).await.unwrap();
        assert_eq!(resent.ticket_id, "t-1");
        assert!(matches!(
            coordinator.resend("a@x.com", &client()).await,
            Err(RegistrationError::TooManyAttempts)
        ));
        assert!(matches!(
            coordinator.resend("a@x.com", &client()).await,
            Err(RegistrationError::SessionNotFound)
        ));
        assert!(matches!(
            coordinator.resend("a@x.com", &client()).await,
            Err(RegistrationError::AlreadyVerified)
        ));
    }

    #[tokio::test]
    async fn validation_happens_before_any_side_effect() {
        let fx = Fixture::new();
        let mut codes = MockCodeService::new();
        codes.expect_issue().never();
        let mut identities = MockIdentityStore::new();
        identities.expect_exists_by_email().never();

        let coordinator = fx.coordinator(codes, Arc::new(identities));
        let mut p = payload();
        p.last_name.clear();
        let err = coordinator.initiate(p, &client()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::ValidationFailed(ValidationError::MissingField("last_name"))
        ));
        assert_eq!(fx.store.stored_entries().await, 0);
    }
}
