//! HTTP surface.
//!
//! Thin axum adapter over the registration coordinators: it decodes JSON,
//! derives the client fingerprint from request headers and maps
//! [`RegistrationError`] onto status codes. No registration logic lives here.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::config::RegistrationConfig;
use crate::error::RegistrationError;
use crate::models::ClientFingerprint;
use crate::registration::{
    Collaborators, EnterpriseRegistrar, EnterpriseSignup, RegistrationCoordinator, RegistrationStatus,
    SignupPayload,
};

#[derive(Clone)]
pub struct AppState {
    pub registration: Arc<RegistrationCoordinator>,
    pub enterprise: Arc<EnterpriseRegistrar>,
    pub service_name: String,
}

impl AppState {
    pub fn new(deps: Collaborators, config: &RegistrationConfig, service_name: impl Into<String>) -> Self {
        Self {
            registration: Arc::new(RegistrationCoordinator::new(deps.clone(), config)),
            enterprise: Arc::new(EnterpriseRegistrar::new(deps, config)),
            service_name: service_name.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/register/complete", post(complete_registration))
        .route("/register/resend-verification", post(resend_verification))
        .route("/enterprise/register", post(enterprise_register))
        .route("/enterprise/register/complete", post(enterprise_complete))
        .route("/enterprise/register/resend", post(enterprise_resend))
        .route("/enterprise/register/status/{account_id}", get(enterprise_status))
        .with_state(state)
}

/// Error body: `{ "code": <status>, "message": <text> }`.
#[derive(Debug)]
pub enum ApiError {
    Registration(RegistrationError),
    MalformedRequest(String),
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        ApiError::Registration(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::MalformedRequest(rejection.body_text())
    }
}

fn status_for(err: &RegistrationError) -> StatusCode {
    match err {
        RegistrationError::ValidationFailed(_) | RegistrationError::CodeRejected(_) => StatusCode::BAD_REQUEST,
        RegistrationError::DuplicateClaim(_) | RegistrationError::AlreadyVerified => StatusCode::CONFLICT,
        RegistrationError::SessionNotFound => StatusCode::NOT_FOUND,
        RegistrationError::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
        RegistrationError::AccountCreationFailed(_) | RegistrationError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RegistrationError::SessionPersistFailed(_) | RegistrationError::CodeIssuanceFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MalformedRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Registration(err) => {
                let status = status_for(&err);
                let message = if err.is_infrastructure() {
                    error!(status = status.as_u16(), "Registration request failed: {}", err);
                    if status == StatusCode::SERVICE_UNAVAILABLE {
                        "service temporarily unavailable".to_string()
                    } else {
                        "registration could not be processed, please retry".to_string()
                    }
                } else {
                    err.to_string()
                };
                (status, message)
            }
        };

        let body = Json(json!({
            "code": status.as_u16(),
            "message": message,
        }));
        (status, body).into_response()
    }
}

/// Success body: a human-readable message next to the payload fields.
#[derive(Serialize)]
struct Envelope<T> {
    message: &'static str,
    #[serde(flatten)]
    data: T,
}

fn envelope<T: Serialize>(status: StatusCode, message: &'static str, data: T) -> Response {
    (status, Json(Envelope { message, data })).into_response()
}

/// User agent plus the first `X-Forwarded-For` hop, falling back to
/// `X-Real-IP`.
pub fn client_fingerprint(headers: &HeaderMap) -> ClientFingerprint {
    let ip_address = header(headers, "x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .or_else(|| header(headers, "x-real-ip"))
        .unwrap_or("unknown");

    ClientFingerprint::new(header(headers, "user-agent").unwrap_or("unknown"), ip_address)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(alias = "user_id")]
    pub session_id: Uuid,
    #[serde(alias = "otp_id")]
    pub ticket_id: String,
    #[serde(alias = "otp_code")]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct EnterpriseCompleteRequest {
    #[serde(alias = "user_id")]
    pub account_id: Uuid,
    #[serde(alias = "otp_id")]
    pub ticket_id: String,
    #[serde(alias = "otp_code")]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(Serialize)]
struct StatusBody {
    account_id: Uuid,
    status: RegistrationStatus,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": state.service_name }))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SignupPayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let pending = state
        .registration
        .initiate(payload, &client_fingerprint(&headers))
        .await?;
    Ok(envelope(
        StatusCode::ACCEPTED,
        "verification code sent, complete registration to activate the account",
        pending,
    ))
}

async fn complete_registration(
    State(state): State<AppState>,
    request: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let completed = state
        .registration
        .complete(request.session_id, &request.code, &request.ticket_id)
        .await?;
    Ok(envelope(StatusCode::CREATED, "registration completed", completed))
}

async fn resend_verification(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<ResendRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let resent = state
        .registration
        .resend(&request.email, &client_fingerprint(&headers))
        .await?;
    Ok(envelope(StatusCode::OK, "verification code resent", resent))
}

async fn enterprise_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    signup: Result<Json<EnterpriseSignup>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(signup) = signup?;
    let pending = state
        .enterprise
        .initiate(signup, &client_fingerprint(&headers))
        .await?;
    Ok(envelope(
        StatusCode::ACCEPTED,
        "verification code sent, complete registration to activate the account",
        pending,
    ))
}

async fn enterprise_complete(
    State(state): State<AppState>,
    request: Result<Json<EnterpriseCompleteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let completed = state
        .enterprise
        .complete(request.account_id, &request.code, &request.ticket_id)
        .await?;
    Ok(envelope(StatusCode::OK, "registration completed", completed))
}

async fn enterprise_resend(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<ResendRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let resent = state
        .enterprise
        .resend(&request.email, &client_fingerprint(&headers))
        .await?;
    Ok(envelope(StatusCode::OK, "verification code resent", resent))
}

async fn enterprise_status(
    State(state): State<AppState>,
    account_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<StatusBody>, ApiError> {
    let Path(account_id) = account_id?;
    let status = state.enterprise.status(account_id).await?;
    Ok(Json(StatusBody { account_id, status }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::clock::ManualClock;
    use crate::config::{PasswordHashingConfig, RetryConfig, TokenConfig};
    use crate::credential::CredentialHasher;
    use crate::error::CodeRejection;
    use crate::identity::{InMemoryIdentityStore, JwtTokenIssuer};
    use crate::models::ClaimField;
    use crate::notify::{LogNotifier, NotificationDispatcher};
    use crate::otp::{CodeError, MockCodeService, VerificationTicket};
    use crate::session::{InMemoryEphemeralStore, SessionStore};

    fn app(codes: MockCodeService) -> Router {
        let clock = Arc::new(ManualClock::default());
        let tokens = JwtTokenIssuer::new(
            &TokenConfig {
                secret: "test-secret".into(),
                ..Default::default()
            },
            clock.clone(),
        );
        let deps = Collaborators {
            sessions: SessionStore::new(Arc::new(InMemoryEphemeralStore::new(clock.clone())), clock.clone()),
            codes: Arc::new(codes),
            identities: Arc::new(InMemoryIdentityStore::new(tokens, clock.clone())),
            notifications: NotificationDispatcher::new(Arc::new(LogNotifier), RetryConfig::default()),
            hasher: CredentialHasher::new(&PasswordHashingConfig {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
            })
            .unwrap(),
            clock,
        };
        router(AppState::new(deps, &RegistrationConfig::default(), "registration-service"))
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("user-agent", "test-agent")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn signup_body(email: &str, phone: &str) -> serde_json::Value {
        json!({
            "email": email,
            "phone_number": phone,
            "first_name": "Ada",
            "last_name": "Lovelace",
            "password": "Zk9!mQ2#rT",
            "type": "PLAYER"
        })
    }

    #[tokio::test]
    async fn register_returns_pending_registration() {
        let mut codes = MockCodeService::new();
        codes
            .expect_issue()
            .withf(|email, client, _| {
                email == "a@x.com" && client.ip_address == "203.0.113.7" && client.user_agent == "test-agent"
            })
            .returning(|_, _, _| {
                Ok(VerificationTicket {
                    ticket_id: "t-1".into(),
                    expires_at: chrono::Utc::now() + Duration::minutes(10),
                    resend_after: chrono::Utc::now() + Duration::minutes(2),
                })
            });

        let response = app(codes)
            .oneshot(post("/register", signup_body("A@x.com", "+100")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = read_json(response).await;
        assert_eq!(body["email"], "a@x.com");
        assert_eq!(body["ticket_id"], "t-1");
        assert!(body["session_id"].is_string());
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let mut body = signup_body("a@x.com", "+100");
        body["password"] = json!("short");

        let response = app(MockCodeService::new())
            .oneshot(post("/register", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["code"], 400);
        assert!(body["message"].as_str().unwrap().contains("password"));
    }

    #[tokio::test]
    async fn malformed_json_uses_the_error_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/register/complete")
            .header("content-type", "application/json")
            .body(Body::from("{\"session_id\": 42"))
            .unwrap();

        let response = app(MockCodeService::new()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], 400);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let response = app(MockCodeService::new())
            .oneshot(post(
                "/register/complete",
                json!({ "user_id": Uuid::new_v4(), "otp_id": "t-1", "otp_code": "123456" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn resend_throttling_is_too_many_requests() {
        let mut codes = MockCodeService::new();
        codes
            .expect_resend()
            .returning(|_, _| Err(CodeError::TooManyAttempts));

        let response = app(codes)
            .oneshot(post("/register/resend-verification", json!({ "email": "a@x.com" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn issuance_failures_are_opaque() {
        let mut codes = MockCodeService::new();
        codes
            .expect_issue()
            .returning(|_, _, _| Err(CodeError::Unavailable("relay at 10.1.2.3 refused".into())));

        let response = app(codes)
            .oneshot(post("/register", signup_body("a@x.com", "+100")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = read_json(response).await;
        assert!(!body["message"].as_str().unwrap().contains("10.1.2.3"));
    }

    #[tokio::test]
    async fn enterprise_status_reports_unknown_accounts() {
        let response = app(MockCodeService::new())
            .oneshot(
                Request::builder()
                    .uri(format!("/enterprise/register/status/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let response = app(MockCodeService::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["service"], "registration-service");
    }

    #[test]
    fn status_mapping_covers_every_error_class() {
        let cases = [
            (RegistrationError::DuplicateClaim(ClaimField::Email), StatusCode::CONFLICT),
            (RegistrationError::AlreadyVerified, StatusCode::CONFLICT),
            (RegistrationError::SessionNotFound, StatusCode::NOT_FOUND),
            (
                RegistrationError::CodeRejected(CodeRejection::Expired),
                StatusCode::BAD_REQUEST,
            ),
            (RegistrationError::TooManyAttempts, StatusCode::TOO_MANY_REQUESTS),
            (
                RegistrationError::AccountCreationFailed("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (RegistrationError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                RegistrationError::SessionPersistFailed("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                RegistrationError::CodeIssuanceFailed("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }

    #[test]
    fn fingerprint_takes_the_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        headers.insert("x-forwarded-for", " 198.51.100.4 , 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.9.9.9".parse().unwrap());
        assert_eq!(
            client_fingerprint(&headers),
            ClientFingerprint::new("curl/8.0", "198.51.100.4")
        );

        headers.remove("x-forwarded-for");
        assert_eq!(client_fingerprint(&headers).ip_address, "10.9.9.9");
        assert_eq!(client_fingerprint(&HeaderMap::new()).user_agent, "unknown");
    }
}
