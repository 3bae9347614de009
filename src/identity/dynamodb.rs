//! DynamoDB identity store.
//!
//! Single-table layout keyed by `pk`:
//!
//! | item    | `pk`                    | attributes                              |
//! |---------|-------------------------|-----------------------------------------|
//! | account | `ACCOUNT#<id>`          | account fields, profile as JSON         |
//! | claim   | `EMAIL#<email>`         | `account_id`                            |
//! | claim   | `PHONE#<phone>`         | `account_id`                            |
//! | claim   | `USERNAME#<username>`   | `account_id` (lowercased username)      |
//!
//! An account and its claim items are written in one `TransactWriteItems`
//! call, every put conditioned on `attribute_not_exists(pk)`. A cancelled
//! transaction means some claim is taken; the claims are then read back to
//! name the colliding field.
//!
//! @author Joseph G Noonan
//! @copyright 2025
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::Region;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::get_item::{GetItemError, GetItemOutput};
use aws_sdk_dynamodb::operation::transact_write_items::{
    TransactWriteItemsError, TransactWriteItemsOutput,
};
use aws_sdk_dynamodb::operation::update_item::{UpdateItemError, UpdateItemOutput};
use aws_sdk_dynamodb::types::{AttributeValue, Delete, Put, TransactWriteItem};
use aws_sdk_dynamodb::Client as AwsDynamoDbClient;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    username_key, AccountRecord, IdentityError, IdentityStore, IssuedCredentials,
    JwtTokenIssuer, NewAccount,
};
use crate::clock::Clock;
use crate::config::IdentityStoreConfig;
use crate::models::{AccountClass, ClaimField, ProfileFields};

type Item = HashMap<String, AttributeValue>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DynamoDbOps: Send + Sync {
    async fn get_item(&self, table: &str, key: Item) -> Result<GetItemOutput, SdkError<GetItemError>>;

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update_expression: &str,
        condition_expression: &str,
        values: Item,
    ) -> Result<UpdateItemOutput, SdkError<UpdateItemError>>;

    async fn transact_write_items(
        &self,
        items: Vec<TransactWriteItem>,
    ) -> Result<TransactWriteItemsOutput, SdkError<TransactWriteItemsError>>;
}

#[async_trait]
impl DynamoDbOps for AwsDynamoDbClient {
    async fn get_item(&self, table: &str, key: Item) -> Result<GetItemOutput, SdkError<GetItemError>> {
        self.get_item()
            .table_name(table)
            .set_key(Some(key))
            .consistent_read(true)
            .send()
            .await
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update_expression: &str,
        condition_expression: &str,
        values: Item,
    ) -> Result<UpdateItemOutput, SdkError<UpdateItemError>> {
        self.update_item()
            .table_name(table)
            .set_key(Some(key))
            .update_expression(update_expression)
            .condition_expression(condition_expression)
            .set_expression_attribute_values(Some(values))
            .send()
            .await
    }

    async fn transact_write_items(
        &self,
        items: Vec<TransactWriteItem>,
    ) -> Result<TransactWriteItemsOutput, SdkError<TransactWriteItemsError>> {
        self.transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
    }
}

/// Identity store backed by a single DynamoDB table.
pub struct DynamoDbIdentityStore {
    client: Box<dyn DynamoDbOps>,
    table_name: String,
    tokens: JwtTokenIssuer,
    clock: Arc<dyn Clock>,
}

impl DynamoDbIdentityStore {
    /// Builds an AWS client from the configured region and optional endpoint.
    ///
    /// # Arguments
    /// * `config` - Identity store section; `table_name` and `region` are required
    /// * `tokens` - Issuer used by `issue_credentials`
    /// * `clock` - Source of `created_at` timestamps
    ///
    /// # Returns
    /// * `Result<Self>` - New store or error if the configuration is incomplete
    pub async fn connect(
        config: &IdentityStoreConfig,
        tokens: JwtTokenIssuer,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IdentityError> {
        let table_name = config
            .table_name
            .clone()
            .ok_or_else(|| IdentityError::Unavailable("identity_store.table_name is not set".into()))?;
        let region = config
            .region
            .clone()
            .ok_or_else(|| IdentityError::Unavailable("identity_store.region is not set".into()))?;

        let region_provider = RegionProviderChain::first_try(Region::new(region));
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        info!(table = %table_name, "Using DynamoDB identity store");
        Ok(Self::with_client(
            Box::new(AwsDynamoDbClient::new(&shared_config)),
            table_name,
            tokens,
            clock,
        ))
    }

    /// Wraps an existing client, typically a mock in tests.
    ///
    /// # Arguments
    /// * `client` - Any [`DynamoDbOps`] implementation
    /// * `table_name` - Table holding account and claim items
    pub fn with_client(
        client: Box<dyn DynamoDbOps>,
        table_name: String,
        tokens: JwtTokenIssuer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            table_name,
            tokens,
            clock,
        }
    }

    async fn get(&self, pk: String) -> Result<Option<Item>, IdentityError> {
        let output = self
            .client
            .get_item(&self.table_name, key(pk))
            .await
            .map_err(|e| unavailable("get item", e))?;
        Ok(output.item().cloned())
    }

    async fn claim_owner(&self, pk: String) -> Result<Option<Uuid>, IdentityError> {
        match self.get(pk).await? {
            Some(item) => Ok(Some(uuid_attr(&item, "account_id")?)),
            None => Ok(None),
        }
    }

    /// Names the claim of `account` that another account already holds.
    async fn find_collision(&self, account: &NewAccount) -> Result<Option<ClaimField>, IdentityError> {
        for (field, pk) in claim_keys(account) {
            if self.claim_owner(pk).await?.is_some() {
                return Ok(Some(field));
            }
        }
        Ok(None)
    }

    fn put(&self, item: Item) -> Result<TransactWriteItem, IdentityError> {
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(pk)")
            .build()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    fn delete(&self, pk: String) -> Result<TransactWriteItem, IdentityError> {
        let delete = Delete::builder()
            .table_name(&self.table_name)
            .set_key(Some(key(pk)))
            .build()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        Ok(TransactWriteItem::builder().delete(delete).build())
    }
}

fn unavailable<E: std::fmt::Display>(operation: &str, err: E) -> IdentityError {
    error!("DynamoDB {} failed: {}", operation, err);
    IdentityError::Unavailable(format!("{operation}: {err}"))
}

fn key(pk: String) -> Item {
    HashMap::from([("pk".to_string(), AttributeValue::S(pk))])
}

fn account_pk(account_id: Uuid) -> String {
    format!("ACCOUNT#{account_id}")
}

fn email_pk(email: &str) -> String {
    format!("EMAIL#{email}")
}

fn phone_pk(phone_number: &str) -> String {
    format!("PHONE#{phone_number}")
}

fn username_pk(username: &str) -> String {
    format!("USERNAME#{}", username_key(username))
}

fn claim_keys(account: &NewAccount) -> Vec<(ClaimField, String)> {
    let mut keys = vec![(ClaimField::Email, email_pk(&account.email))];
    if let Some(phone) = &account.phone_number {
        keys.push((ClaimField::PhoneNumber, phone_pk(phone)));
    }
    if let Some(username) = &account.username {
        keys.push((ClaimField::Username, username_pk(username)));
    }
    keys
}

fn claim_item(pk: String, account_id: Uuid) -> Item {
    HashMap::from([
        ("pk".to_string(), AttributeValue::S(pk)),
        ("account_id".to_string(), AttributeValue::S(account_id.to_string())),
    ])
}

fn account_item(
    account_id: Uuid,
    account: &NewAccount,
    created_at: DateTime<Utc>,
) -> Result<Item, IdentityError> {
    let profile = serde_json::to_string(&account.profile)
        .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
    let class = match account.class {
        AccountClass::SelfService => "self_service",
        AccountClass::Enterprise => "enterprise",
    };

    let mut item = HashMap::from([
        ("pk".to_string(), AttributeValue::S(account_pk(account_id))),
        ("account_id".to_string(), AttributeValue::S(account_id.to_string())),
        ("email".to_string(), AttributeValue::S(account.email.clone())),
        ("profile".to_string(), AttributeValue::S(profile)),
        (
            "credential".to_string(),
            AttributeValue::S(account.credential.as_str().to_string()),
        ),
        ("class".to_string(), AttributeValue::S(class.to_string())),
        ("email_verified".to_string(), AttributeValue::Bool(false)),
        ("created_at".to_string(), AttributeValue::S(created_at.to_rfc3339())),
    ]);
    if let Some(phone) = &account.phone_number {
        item.insert("phone_number".to_string(), AttributeValue::S(phone.clone()));
    }
    if let Some(username) = &account.username {
        item.insert("username".to_string(), AttributeValue::S(username.clone()));
    }
    Ok(item)
}

fn string_attr(item: &Item, name: &str) -> Result<String, IdentityError> {
    item.get(name)
        .and_then(|av| av.as_s().ok())
        .cloned()
        .ok_or_else(|| IdentityError::Unavailable(format!("failed to parse {name} from DynamoDB response")))
}

fn optional_string_attr(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|av| av.as_s().ok()).cloned()
}

fn uuid_attr(item: &Item, name: &str) -> Result<Uuid, IdentityError> {
    Uuid::parse_str(&string_attr(item, name)?)
        .map_err(|e| IdentityError::Unavailable(format!("invalid {name}: {e}")))
}

fn record_from_item(item: &Item) -> Result<AccountRecord, IdentityError> {
    let profile: ProfileFields = serde_json::from_str(&string_attr(item, "profile")?)
        .map_err(|e| IdentityError::Unavailable(format!("invalid profile: {e}")))?;
    let class = match string_attr(item, "class")?.as_str() {
        "enterprise" => AccountClass::Enterprise,
        _ => AccountClass::SelfService,
    };
    let created_at = DateTime::parse_from_rfc3339(&string_attr(item, "created_at")?)
        .map_err(|e| IdentityError::Unavailable(format!("invalid created_at: {e}")))?
        .with_timezone(&Utc);
    let email_verified = item
        .get("email_verified")
        .and_then(|av| av.as_bool().ok())
        .copied()
        .unwrap_or(false);

    Ok(AccountRecord {
        account_id: uuid_attr(item, "account_id")?,
        email: string_attr(item, "email")?,
        phone_number: optional_string_attr(item, "phone_number"),
        username: optional_string_attr(item, "username"),
        profile,
        class,
        email_verified,
        created_at,
    })
}

#[async_trait]
impl IdentityStore for DynamoDbIdentityStore {
    async fn exists_by_email(&self, email: &str) -> Result<bool, IdentityError> {
        Ok(self.get(email_pk(email)).await?.is_some())
    }

    async fn exists_by_phone(&self, phone_number: &str) -> Result<bool, IdentityError> {
        Ok(self.get(phone_pk(phone_number)).await?.is_some())
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool, IdentityError> {
        Ok(self.get(username_pk(username)).await?.is_some())
    }

    /// Writes the account item and every claim item in one transaction.
    ///
    /// # Arguments
    /// * `account` - Account to commit, unverified
    ///
    /// # Returns
    /// * `Result<Uuid>` - The new account id, `UniqueViolation` naming the
    ///   taken claim, or `Unavailable` on any other failure
    async fn create(&self, account: NewAccount) -> Result<Uuid, IdentityError> {
        let account_id = Uuid::new_v4();
        let mut items = vec![self.put(account_item(account_id, &account, self.clock.now())?)?];
        for (_, pk) in claim_keys(&account) {
            items.push(self.put(claim_item(pk, account_id))?);
        }

        if let Err(err) = self.client.transact_write_items(items).await {
            let cancelled = err
                .as_service_error()
                .is_some_and(|e| e.is_transaction_canceled_exception());
            if !cancelled {
                return Err(unavailable("transact write", err));
            }

            return match self.find_collision(&account).await? {
                Some(field) => {
                    warn!(field = %field, "Account creation lost a uniqueness race");
                    Err(IdentityError::UniqueViolation(field))
                }
                None => Err(IdentityError::Unavailable(
                    "account transaction cancelled without a conflicting claim".into(),
                )),
            };
        }

        info!(account_id = %account_id, "Account created");
        Ok(account_id)
    }

    async fn set_email_verified(&self, account_id: Uuid, verified: bool) -> Result<(), IdentityError> {
        let values = HashMap::from([(":verified".to_string(), AttributeValue::Bool(verified))]);
        let result = self
            .client
            .update_item(
                &self.table_name,
                key(account_pk(account_id)),
                "SET email_verified = :verified",
                "attribute_exists(pk)",
                values,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Err(IdentityError::NotFound)
            }
            Err(err) => Err(unavailable("update item", err)),
        }
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<AccountRecord>, IdentityError> {
        match self.get(account_pk(account_id)).await? {
            Some(item) => Ok(Some(record_from_item(&item)?)),
            None => Ok(None),
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, IdentityError> {
        match self.claim_owner(email_pk(email)).await? {
            Some(account_id) => self.find_account(account_id).await,
            None => Ok(None),
        }
    }

    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError> {
        let Some(record) = self.find_account(account_id).await? else {
            return Ok(());
        };

        let mut items = vec![
            self.delete(account_pk(account_id))?,
            self.delete(email_pk(&record.email))?,
        ];
        if let Some(phone) = &record.phone_number {
            items.push(self.delete(phone_pk(phone))?);
        }
        if let Some(username) = &record.username {
            items.push(self.delete(username_pk(username))?);
        }

        self.client
            .transact_write_items(items)
            .await
            .map_err(|e| unavailable("transact write", e))?;
        info!(account_id = %account_id, "Account deleted");
        Ok(())
    }

    async fn issue_credentials(&self, account_id: Uuid) -> Result<IssuedCredentials, IdentityError> {
        if self.get(account_pk(account_id)).await?.is_none() {
            return Err(IdentityError::NotFound);
        }
        Ok(self.tokens.issue(account_id)?)
    }
}
