use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{
    username_key, AccountRecord, IdentityError, IdentityStore, IssuedCredentials,
    JwtTokenIssuer, NewAccount,
};
use crate::clock::Clock;
use crate::models::{ClaimField, CredentialHash};

struct StoredAccount {
    record: AccountRecord,
    credential: CredentialHash,
}

#[derive(Default)]
struct Accounts {
    by_id: HashMap<Uuid, StoredAccount>,
    by_email: HashMap<String, Uuid>,
    by_phone: HashMap<String, Uuid>,
    by_username: HashMap<String, Uuid>,
}

impl Accounts {
    fn collision(&self, account: &NewAccount) -> Option<ClaimField> {
        if self.by_email.contains_key(&account.email) {
            return Some(ClaimField::Email);
        }
        if let Some(phone) = &account.phone_number {
            if self.by_phone.contains_key(phone) {
                return Some(ClaimField::PhoneNumber);
            }
        }
        if let Some(username) = &account.username {
            if self.by_username.contains_key(&username_key(username)) {
                return Some(ClaimField::Username);
            }
        }
        None
    }
}

/// Identity store held in process memory.
///
/// Uniqueness is checked and claimed under the same lock, so concurrent
/// `create` calls for one claim have exactly one winner.
pub struct InMemoryIdentityStore {
    accounts: Mutex<Accounts>,
    tokens: JwtTokenIssuer,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdentityStore {
    pub fn new(tokens: JwtTokenIssuer, clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: Mutex::new(Accounts::default()),
            tokens,
            clock,
        }
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.lock().await.by_id.len()
    }

    /// The credential hash stored for an account.
    pub async fn stored_credential(&self, account_id: Uuid) -> Option<CredentialHash> {
        self.accounts
            .lock()
            .await
            .by_id
            .get(&account_id)
            .map(|stored| stored.credential.clone())
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn exists_by_email(&self, email: &str) -> Result<bool, IdentityError> {
        Ok(self.accounts.lock().await.by_email.contains_key(email))
    }

    async fn exists_by_phone(&self, phone_number: &str) -> Result<bool, IdentityError> {
        Ok(self.accounts.lock().await.by_phone.contains_key(phone_number))
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool, IdentityError> {
        Ok(self
            .accounts
            .lock()
            .await
            .by_username
            .contains_key(&username_key(username)))
    }

    async fn create(&self, account: NewAccount) -> Result<Uuid, IdentityError> {
        let account_id = Uuid::new_v4();
        {
            let mut accounts = self.accounts.lock().await;
            if let Some(field) = accounts.collision(&account) {
                return Err(IdentityError::UniqueViolation(field));
            }

            accounts.by_email.insert(account.email.clone(), account_id);
            if let Some(phone) = &account.phone_number {
                accounts.by_phone.insert(phone.clone(), account_id);
            }
            if let Some(username) = &account.username {
                accounts.by_username.insert(username_key(username), account_id);
            }

            let record = AccountRecord {
                account_id,
                email: account.email,
                phone_number: account.phone_number,
                username: account.username,
                profile: account.profile,
                class: account.class,
                email_verified: false,
                created_at: self.clock.now(),
            };
            accounts.by_id.insert(
                account_id,
                StoredAccount {
                    record,
                    credential: account.credential,
                },
            );
        }

        info!(account_id = %account_id, "Account created");
        Ok(account_id)
    }

    async fn set_email_verified(&self, account_id: Uuid, verified: bool) -> Result<(), IdentityError> {
        let mut accounts = self.accounts.lock().await;
        let stored = accounts.by_id.get_mut(&account_id).ok_or(IdentityError::NotFound)?;
        stored.record.email_verified = verified;
        Ok(())
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<AccountRecord>, IdentityError> {
        Ok(self
            .accounts
            .lock()
            .await
            .by_id
            .get(&account_id)
            .map(|stored| stored.record.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, IdentityError> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .by_email
            .get(email)
            .and_then(|id| accounts.by_id.get(id))
            .map(|stored| stored.record.clone()))
    }

    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError> {
        let mut accounts = self.accounts.lock().await;
        let Some(stored) = accounts.by_id.remove(&account_id) else {
            return Ok(());
        };

        accounts.by_email.remove(&stored.record.email);
        if let Some(phone) = &stored.record.phone_number {
            accounts.by_phone.remove(phone);
        }
        if let Some(username) = &stored.record.username {
            accounts.by_username.remove(&username_key(username));
        }
        info!(account_id = %account_id, "Account deleted");
        Ok(())
    }

    async fn issue_credentials(&self, account_id: Uuid) -> Result<IssuedCredentials, IdentityError> {
        if !self.accounts.lock().await.by_id.contains_key(&account_id) {
            return Err(IdentityError::NotFound);
        }
        Ok(self.tokens.issue(account_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::TokenConfig;
    use crate::models::{AccountClass, ProfileFields};

    fn store() -> Arc<InMemoryIdentityStore> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tokens = JwtTokenIssuer::new(
            &TokenConfig {
                secret: "test-secret".into(),
                ..Default::default()
            },
            clock.clone(),
        );
        Arc::new(InMemoryIdentityStore::new(tokens, clock))
    }

    fn account(email: &str, phone: &str, username: Option<&str>) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            phone_number: Some(phone.to_string()),
            username: username.map(str::to_string),
            profile: ProfileFields::default(),
            credential: CredentialHash::new("$argon2id$stub".into()),
            class: AccountClass::SelfService,
        }
    }

    #[tokio::test]
    async fn create_enforces_every_unique_claim() {
        let store = store();
        store
            .create(account("a@x.com", "+100", Some("Ada")))
            .await
            .unwrap();

        let cases = [
            (account("a@x.com", "+200", None), ClaimField::Email),
            (account("b@x.com", "+100", None), ClaimField::PhoneNumber),
            (account("b@x.com", "+200", Some("ada")), ClaimField::Username),
        ];
        for (candidate, expected) in cases {
            match store.create(candidate).await {
                Err(IdentityError::UniqueViolation(field)) => assert_eq!(field, expected),
                other => panic!("expected violation on {expected}, got {other:?}"),
            }
        }
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_creates_have_one_winner() {
        let store = store();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create(account("race@x.com", &format!("+10{i}"), None))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn accounts_start_unverified_and_release_claims_on_delete() {
        let store = store();
        let account_id = store
            .create(account("a@x.com", "+100", Some("ada")))
            .await
            .unwrap();

        let record = store.find_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.account_id, account_id);
        assert!(!store.issue_credentials(account_id).await.unwrap().access_token.is_empty());
        assert!(!record.email_verified);

        store.set_email_verified(account_id, true).await.unwrap();
        assert!(store.find_account(account_id).await.unwrap().unwrap().email_verified);

        store.delete_account(account_id).await.unwrap();
        store.delete_account(account_id).await.unwrap();
        assert!(!store.exists_by_email("a@x.com").await.unwrap());
        assert!(!store.exists_by_phone("+100").await.unwrap());
        assert!(!store.exists_by_username("ADA").await.unwrap());
        assert!(matches!(
            store.set_email_verified(account_id, true).await,
            Err(IdentityError::NotFound)
        ));
        assert!(matches!(
            store.issue_credentials(account_id).await,
            Err(IdentityError::NotFound)
        ));
    }
}
