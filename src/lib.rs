/// Casino Registration Service Library
///
/// Self-service player/agent signup with mandatory email verification, plus
/// an enterprise/operator variant. A signup is held in an ephemeral store
/// until its one-time code is verified; only then is a durable identity
/// created.
///
/// # Features
/// - Two-phase registration: initiate, complete, resend
/// - Uniqueness guard on email, phone number and username
/// - Pluggable session store (memory, Redis), identity store (memory,
///   DynamoDB), code service (local, Twilio Verify) and mailer
/// - JSON HTTP surface built on axum
///
/// # Modules
/// - `registration`: coordinators, payload validation and uniqueness guard
/// - `session`: ephemeral TTL store and typed session records
/// - `otp`: one-time-code issuance and verification
/// - `identity`: durable account store and token issuance
/// - `notify`: verification and welcome mail delivery
/// - `http`: axum router and error mapping
/// - `config`: configuration management
pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod identity;
pub mod models;
pub mod notify;
pub mod otp;
pub mod registration;
pub mod session;
