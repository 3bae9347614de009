//! Shared domain types.
//!
//! Types that flow between the coordinator and its collaborators: the
//! uniqueness-guarded identity claims, the profile carried through a signup
//! untouched, the hashed credential and the client fingerprint attached to
//! verification mails.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the identity claims the durable store keeps unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimField {
    Email,
    PhoneNumber,
    Username,
}

impl fmt::Display for ClaimField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimField::Email => f.write_str("email"),
            ClaimField::PhoneNumber => f.write_str("phone number"),
            ClaimField::Username => f.write_str("username"),
        }
    }
}

/// Account-type tag submitted with a signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    #[default]
    Player,
    Agent,
    Admin,
}

impl AccountType {
    /// Parses the wire tag, case-insensitively.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "PLAYER" => Some(AccountType::Player),
            "AGENT" => Some(AccountType::Agent),
            "ADMIN" => Some(AccountType::Admin),
            _ => None,
        }
    }
}

/// Which registration pipeline produced an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountClass {
    SelfService,
    Enterprise,
}

/// Signup attributes that are carried through to the durable account
/// unchanged. The coordinator never interprets these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub first_name: String,
    pub last_name: String,
    pub account_type: AccountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referred_by_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_request_id: Option<String>,
}

/// An argon2 PHC hash of the submitted password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHash(String);

impl CredentialHash {
    pub fn new(phc: String) -> Self {
        Self(phc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHash(<redacted>)")
    }
}

/// Who asked for a verification code, shown in the security context of the
/// verification mail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFingerprint {
    pub user_agent: String,
    pub ip_address: String,
}

impl ClientFingerprint {
    pub fn new(user_agent: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ip_address: ip_address.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_parses_case_insensitively() {
        assert_eq!(AccountType::parse("player"), Some(AccountType::Player));
        assert_eq!(AccountType::parse(" AGENT "), Some(AccountType::Agent));
        assert_eq!(AccountType::parse("Admin"), Some(AccountType::Admin));
        assert_eq!(AccountType::parse("croupier"), None);
    }

    #[test]
    fn credential_hash_is_redacted_in_debug_output() {
        let hash = CredentialHash::new("$argon2id$v=19$secret".to_string());
        assert_eq!(format!("{:?}", hash), "CredentialHash(<redacted>)");
        assert_eq!(
            serde_json::to_string(&hash).unwrap(),
            "\"$argon2id$v=19$secret\""
        );
    }
}
