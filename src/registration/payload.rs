//! Signup payloads and their validation.
//!
//! Both historical request shapes (the short form and the detailed form with
//! address and referral data) deserialise into [`SignupPayload`]; the
//! coordinator only ever sees the [`ValidatedSignup`] it resolves to.
//! Validation performs no I/O.

use std::fmt;

use phonenumber::Mode;
use serde::Deserialize;
use thiserror::Error;
use validator::ValidateEmail;

use crate::models::{AccountType, ProfileFields};

const MAX_EMAIL_LEN: usize = 254;
const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?~`";
const WEAK_PATTERNS: &[&str] = &[
    "password", "123456", "qwerty", "abc123", "admin", "user", "test", "guest", "root", "login",
];
const SEQUENCES: &[&str] = &["abcdefghijklmnopqrstuvwxyz", "qwertyuiop", "asdfghjkl", "zxcvbnm"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid email format")]
    InvalidEmail,

    #[error("email address is too long (maximum 254 characters)")]
    EmailTooLong,

    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),

    #[error("password {0}")]
    WeakPassword(&'static str),

    #[error("invalid account type: {0}")]
    InvalidAccountType(String),
}

/// A signup request as received, in either shape.
#[derive(Clone, Default, Deserialize)]
pub struct SignupPayload {
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "phone")]
    pub phone_number: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "type", alias = "account_type", alias = "user_type")]
    pub account_type: Option<String>,
    #[serde(default, alias = "referal_type")]
    pub referral_type: Option<String>,
    #[serde(default, alias = "refered_by_code")]
    pub referred_by_code: Option<String>,
    #[serde(default)]
    pub referral_code: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub street_address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub kyc_status: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub agent_request_id: Option<String>,
}

impl fmt::Debug for SignupPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupPayload")
            .field("email", &self.email)
            .field("phone_number", &self.phone_number)
            .field("username", &self.username)
            .field("account_type", &self.account_type)
            .finish_non_exhaustive()
    }
}

/// A signup that passed every structural rule.
#[derive(Clone)]
pub struct ValidatedSignup {
    pub email: String,
    pub phone_number: String,
    pub username: Option<String>,
    pub password: String,
    pub profile: ProfileFields,
}

impl fmt::Debug for ValidatedSignup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedSignup")
            .field("email", &self.email)
            .field("phone_number", &self.phone_number)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl SignupPayload {
    pub fn validate(self, default_currency: &str) -> Result<ValidatedSignup, ValidationError> {
        let email = required(&self.email, "email")?;
        let phone = required(&self.phone_number, "phone_number")?;
        let first_name = required(&self.first_name, "first_name")?;
        let last_name = required(&self.last_name, "last_name")?;
        if self.password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }

        let email = normalize_email(&email)?;
        let username = match non_empty(self.username) {
            Some(username) => {
                validate_username(&username)?;
                Some(username)
            }
            None => None,
        };
        validate_password(&self.password)?;
        let account_type = parse_account_type(self.account_type.as_deref())?;

        let profile = ProfileFields {
            first_name,
            last_name,
            account_type,
            referral_type: non_empty(self.referral_type),
            referred_by_code: non_empty(self.referred_by_code),
            referral_code: non_empty(self.referral_code),
            company_name: non_empty(self.company_name),
            street_address: non_empty(self.street_address),
            city: non_empty(self.city),
            state: non_empty(self.state),
            country: non_empty(self.country),
            postal_code: non_empty(self.postal_code),
            date_of_birth: non_empty(self.date_of_birth),
            default_currency: Some(
                non_empty(self.default_currency).unwrap_or_else(|| default_currency.to_string()),
            ),
            kyc_status: non_empty(self.kyc_status),
            profile_picture: non_empty(self.profile_picture),
            agent_request_id: non_empty(self.agent_request_id),
        };

        Ok(ValidatedSignup {
            email,
            phone_number: normalize_phone(&phone),
            username,
            password: self.password,
            profile,
        })
    }
}

/// An operator/enterprise signup request.
#[derive(Clone, Default, Deserialize)]
pub struct EnterpriseSignup {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default, alias = "type", alias = "account_type")]
    pub user_type: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub referral_code: Option<String>,
}

impl fmt::Debug for EnterpriseSignup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterpriseSignup")
            .field("email", &self.email)
            .field("user_type", &self.user_type)
            .field("company_name", &self.company_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ValidatedEnterpriseSignup {
    pub email: String,
    pub phone_number: Option<String>,
    pub password: String,
    pub profile: ProfileFields,
}

impl fmt::Debug for ValidatedEnterpriseSignup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedEnterpriseSignup")
            .field("email", &self.email)
            .field("phone_number", &self.phone_number)
            .finish_non_exhaustive()
    }
}

impl EnterpriseSignup {
    pub fn validate(self, default_currency: &str) -> Result<ValidatedEnterpriseSignup, ValidationError> {
        let email = required(&self.email, "email")?;
        if self.password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        let first_name = required(&self.first_name, "first_name")?;
        let last_name = required(&self.last_name, "last_name")?;
        let user_type = required(&self.user_type, "user_type")?;

        let email = normalize_email(&email)?;
        validate_password(&self.password)?;
        let account_type = parse_account_type(Some(&user_type))?;

        Ok(ValidatedEnterpriseSignup {
            email,
            phone_number: non_empty(self.phone_number).map(|phone| normalize_phone(&phone)),
            password: self.password,
            profile: ProfileFields {
                first_name,
                last_name,
                account_type,
                company_name: non_empty(self.company_name),
                referral_code: non_empty(self.referral_code),
                default_currency: Some(default_currency.to_string()),
                ..Default::default()
            },
        })
    }
}

fn required(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_account_type(tag: Option<&str>) -> Result<AccountType, ValidationError> {
    match tag.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(AccountType::default()),
        Some(tag) => {
            AccountType::parse(tag).ok_or_else(|| ValidationError::InvalidAccountType(tag.to_string()))
        }
    }
}

pub fn normalize_email(email: &str) -> Result<String, ValidationError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(ValidationError::EmailTooLong);
    }
    if !email.validate_email() {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(email)
}

/// E.164 form when the number parses as valid, otherwise the trimmed input.
pub fn normalize_phone(phone: &str) -> String {
    let phone = phone.trim();
    match phonenumber::parse(None, phone) {
        Ok(number) if phonenumber::is_valid(&number) => number.format().mode(Mode::E164).to_string(),
        _ => phone.to_string(),
    }
}

fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len = username.chars().count();
    if len < 3 {
        return Err(ValidationError::InvalidUsername("must be at least 3 characters long"));
    }
    if len > 30 {
        return Err(ValidationError::InvalidUsername("must be no more than 30 characters long"));
    }

    let allowed = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let edges_ok = username.starts_with(|c: char| c.is_ascii_alphanumeric())
        && username.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !allowed || !edges_ok {
        return Err(ValidationError::InvalidUsername(
            "may only contain letters, numbers, underscores and hyphens, and must start and end with a letter or number",
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len < 8 {
        return Err(ValidationError::WeakPassword("must be at least 8 characters long"));
    }
    if len > 128 {
        return Err(ValidationError::WeakPassword("must be no more than 128 characters long"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::WeakPassword("must contain at least one uppercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::WeakPassword("must contain at least one lowercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::WeakPassword("must contain at least one number"));
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        return Err(ValidationError::WeakPassword("must contain at least one special character"));
    }

    let lowered = password.to_lowercase();
    if WEAK_PATTERNS.iter().any(|pattern| lowered.contains(pattern)) {
        return Err(ValidationError::WeakPassword("contains a common weak pattern"));
    }
    if has_identical_run(password, 4) {
        return Err(ValidationError::WeakPassword(
            "cannot contain more than 3 consecutive identical characters",
        ));
    }

    // Only the lowercase letters, concatenated, are checked for runs.
    let letters: String = password.chars().filter(|c| c.is_ascii_lowercase()).collect();
    if has_sequence(&letters) {
        return Err(ValidationError::WeakPassword("contains sequential characters"));
    }
    Ok(())
}

fn has_identical_run(value: &str, run: usize) -> bool {
    let chars: Vec<char> = value.chars().collect();
    chars
        .windows(run)
        .any(|window| window.iter().all(|c| *c == window[0]))
}

fn has_sequence(letters: &str) -> bool {
    letters.as_bytes().windows(3).any(|window| {
        SEQUENCES.iter().any(|sequence| {
            sequence
                .as_bytes()
                .windows(3)
                .any(|candidate| candidate == window)
        })
    })
}
