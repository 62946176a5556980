//! DynamoDB-backed lock store.
//!
//! DynamoDB satisfies the store prerequisites: conditional writes are
//! linearized per key and `ConsistentRead` gives strongly consistent gets.
//! Records live in a table with a single `S` hash key named `lock_key`.

use crate::store::{Condition, LockRecord, LockSnapshot, LockStore, StoreError};
use anyhow::{anyhow, ensure, Context};
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{
        CreateTableError, CreateTableErrorKind, DeleteItemError, DeleteItemErrorKind,
        DescribeTableError, DescribeTableErrorKind, GetItemError, GetItemErrorKind, PutItemError,
        PutItemErrorKind, UpdateItemError, UpdateItemErrorKind,
    },
    model::{
        AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
        ScalarAttributeType, TableStatus,
    },
    types::SdkError,
};
use std::{sync::Arc, time::Duration};
use tracing::instrument;
use uuid::Uuid;

const KEY_ATTR: &str = "lock_key";
const VERSION_ATTR: &str = "lock_version";
const LEASE_ATTR: &str = "lease_duration";
const HOST_ATTR: &str = "host_id";

/// How often table status is polled while waiting for control-plane
/// operations to settle.
const TABLE_POLL_PERIOD: Duration = Duration::from_millis(500);
const TABLE_POLL_ATTEMPTS: u32 = 120;

/// [`LockStore`] over a DynamoDB table.
#[derive(Debug, Clone)]
pub struct DynamoDbStore {
    client: aws_sdk_dynamodb::Client,
    table_name: Arc<String>,
}

impl DynamoDbStore {
    /// Returns a store using the given table without checking it.
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: Arc::new(table_name.into()),
        }
    }

    /// Returns a store after checking the table is active with the
    /// expected schema.
    pub async fn connect(
        client: aws_sdk_dynamodb::Client,
        table_name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let store = Self::new(client, table_name);
        store.check_schema().await?;
        Ok(store)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Checks the table is active & has a single `S` hash key named
    /// `lock_key`.
    pub async fn check_schema(&self) -> anyhow::Result<()> {
        let desc = self
            .client
            .describe_table()
            .table_name(self.table_name.as_str())
            .send()
            .await
            .with_context(|| format!("Missing table `{}`?", self.table_name))?
            .table
            .context("no table description")?;

        let attrs = desc.attribute_definitions.unwrap_or_default();
        let key_schema = desc.key_schema.unwrap_or_default();
        ensure!(
            key_schema.len() == 1,
            "Unexpected number of keys ({}) in key_schema, expected 1. Got {:?}",
            key_schema.len(),
            key_schema
                .iter()
                .map(|k| k.attribute_name().unwrap_or("?"))
                .collect::<Vec<_>>(),
        );

        let described_kind = attrs
            .iter()
            .find(|attr| attr.attribute_name() == Some(KEY_ATTR))
            .with_context(|| {
                format!(
                    "Missing attribute definition for {KEY_ATTR}, available {:?}",
                    attrs
                        .iter()
                        .filter_map(|a| a.attribute_name())
                        .collect::<Vec<_>>()
                )
            })?
            .attribute_type()
            .with_context(|| format!("Missing attribute type for {KEY_ATTR}"))?;
        ensure!(
            described_kind == &ScalarAttributeType::S,
            "Unexpected attribute type `{:?}` for {}, expected `{:?}`",
            described_kind,
            KEY_ATTR,
            ScalarAttributeType::S,
        );

        let described_key_type = key_schema
            .iter()
            .find(|k| k.attribute_name() == Some(KEY_ATTR))
            .with_context(|| format!("Missing key schema for {KEY_ATTR}"))?
            .key_type()
            .with_context(|| format!("Missing key type for {KEY_ATTR}"))?;
        ensure!(
            described_key_type == &KeyType::Hash,
            "Unexpected key type `{:?}` for {}, expected `{:?}`",
            described_key_type,
            KEY_ATTR,
            KeyType::Hash,
        );

        Ok(())
    }
}

/// Render a [`Condition`] as a condition expression plus the version value
/// it references, if any.
fn condition_expression(condition: &Condition) -> (String, Option<AttributeValue>) {
    match condition {
        Condition::Free => (format!("attribute_not_exists({KEY_ATTR})"), None),
        Condition::VersionIs(v) => (
            format!("{VERSION_ATTR}=:ver"),
            Some(AttributeValue::S(v.to_string())),
        ),
        Condition::FreeOrVersionIs(v) => (
            format!("attribute_not_exists({KEY_ATTR}) OR {VERSION_ATTR}=:ver"),
            Some(AttributeValue::S(v.to_string())),
        ),
    }
}

#[async_trait]
impl LockStore for DynamoDbStore {
    #[instrument(skip_all)]
    async fn put(
        &self,
        record: &LockRecord,
        condition: Option<&Condition>,
    ) -> Result<(), StoreError> {
        let mut put = self
            .client
            .put_item()
            .table_name(self.table_name.as_str())
            .item(KEY_ATTR, AttributeValue::S(record.name.clone()))
            .item(VERSION_ATTR, AttributeValue::S(record.version.to_string()))
            .item(
                LEASE_ATTR,
                AttributeValue::N(record.lease_duration.to_string()),
            )
            .item(HOST_ATTR, AttributeValue::S(record.host.clone()));

        if let Some(cond) = condition {
            let (expr, ver) = condition_expression(cond);
            put = put.condition_expression(expr);
            if let Some(ver) = ver {
                put = put.expression_attribute_values(":ver", ver);
            }
        }

        match put.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError {
                err:
                    PutItemError {
                        kind: PutItemErrorKind::ConditionalCheckFailedException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::ConditionFailed),
            Err(SdkError::ServiceError {
                err:
                    PutItemError {
                        kind: PutItemErrorKind::ResourceNotFoundException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::NoSuchRecord),
            Err(err) => Err(StoreError::Other(err.into())),
        }
    }

    #[instrument(skip_all)]
    async fn update_version(
        &self,
        name: &str,
        new_version: Uuid,
        condition: Option<&Condition>,
    ) -> Result<(), StoreError> {
        let mut update = self
            .client
            .update_item()
            .table_name(self.table_name.as_str())
            .key(KEY_ATTR, AttributeValue::S(name.to_owned()))
            .update_expression(format!("SET {VERSION_ATTR}=:new_ver"))
            .expression_attribute_values(":new_ver", AttributeValue::S(new_version.to_string()));

        if let Some(cond) = condition {
            let (expr, ver) = condition_expression(cond);
            update = update.condition_expression(expr);
            if let Some(ver) = ver {
                update = update.expression_attribute_values(":ver", ver);
            }
        }

        match update.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError {
                err:
                    UpdateItemError {
                        kind: UpdateItemErrorKind::ConditionalCheckFailedException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::ConditionFailed),
            Err(SdkError::ServiceError {
                err:
                    UpdateItemError {
                        kind: UpdateItemErrorKind::ResourceNotFoundException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::NoSuchRecord),
            Err(err) => Err(StoreError::Other(err.into())),
        }
    }

    #[instrument(skip_all)]
    async fn delete(&self, name: &str, condition: Option<&Condition>) -> Result<(), StoreError> {
        let mut delete = self
            .client
            .delete_item()
            .table_name(self.table_name.as_str())
            .key(KEY_ATTR, AttributeValue::S(name.to_owned()));

        if let Some(cond) = condition {
            let (expr, ver) = condition_expression(cond);
            delete = delete.condition_expression(expr);
            if let Some(ver) = ver {
                delete = delete.expression_attribute_values(":ver", ver);
            }
        }

        match delete.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError {
                err:
                    DeleteItemError {
                        kind: DeleteItemErrorKind::ConditionalCheckFailedException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::ConditionFailed),
            Err(SdkError::ServiceError {
                err:
                    DeleteItemError {
                        kind: DeleteItemErrorKind::ResourceNotFoundException(..),
                        ..
                    },
                ..
            }) => Err(StoreError::NoSuchRecord),
            Err(err) => Err(StoreError::Other(err.into())),
        }
    }

    #[instrument(skip_all)]
    async fn get(&self, name: &str) -> Result<Option<LockSnapshot>, StoreError> {
        let got = self
            .client
            .get_item()
            .table_name(self.table_name.as_str())
            .key(KEY_ATTR, AttributeValue::S(name.to_owned()))
            .consistent_read(true)
            .projection_expression(format!("{VERSION_ATTR}, {LEASE_ATTR}, {HOST_ATTR}"))
            .send()
            .await;

        let output = match got {
            Ok(output) => output,
            Err(SdkError::ServiceError {
                err:
                    GetItemError {
                        kind: GetItemErrorKind::ResourceNotFoundException(..),
                        ..
                    },
                ..
            }) => return Err(StoreError::NoSuchRecord),
            Err(err) => return Err(StoreError::Other(err.into())),
        };

        let Some(item) = output.item else {
            return Ok(None);
        };

        let version = match item.get(VERSION_ATTR) {
            Some(AttributeValue::S(s)) => Uuid::parse_str(s)
                .map_err(|err| StoreError::Other(anyhow!("invalid {VERSION_ATTR}: {err}")))?,
            _ => return Err(StoreError::Other(anyhow!("record missing {VERSION_ATTR}"))),
        };
        let lease_duration = match item.get(LEASE_ATTR) {
            Some(AttributeValue::N(n)) => n
                .parse::<u64>()
                .map_err(|err| StoreError::Other(anyhow!("invalid {LEASE_ATTR}: {err}")))?,
            _ => return Err(StoreError::Other(anyhow!("record missing {LEASE_ATTR}"))),
        };
        let host = match item.get(HOST_ATTR) {
            Some(AttributeValue::S(s)) => s.clone(),
            _ => String::new(),
        };

        Ok(Some(LockSnapshot {
            version,
            lease_duration,
            host,
        }))
    }
}

/// Control-plane helper for creating & destroying lock tables.
///
/// Not used by the locking protocol itself; intended for tests, demos and
/// operational tooling.
#[derive(Debug, Clone)]
pub struct DynamoDbControl {
    client: aws_sdk_dynamodb::Client,
    table_name: Arc<String>,
}

impl DynamoDbControl {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: Arc::new(table_name.into()),
        }
    }

    /// Create the lock table and wait until it is active.
    ///
    /// An already-existing table is not an error.
    pub async fn create(&self) -> anyhow::Result<()> {
        let create = self
            .client
            .create_table()
            .table_name(self.table_name.as_str())
            .billing_mode(BillingMode::PayPerRequest)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(KEY_ATTR)
                    .attribute_type(ScalarAttributeType::S)
                    .build(),
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(KEY_ATTR)
                    .key_type(KeyType::Hash)
                    .build(),
            )
            .send()
            .await;

        match create {
            Ok(_)
            | Err(SdkError::ServiceError {
                err:
                    CreateTableError {
                        kind: CreateTableErrorKind::ResourceInUseException(..),
                        ..
                    },
                ..
            }) => {}
            Err(err) => return Err(err.into()),
        }

        for _ in 0..TABLE_POLL_ATTEMPTS {
            let desc = self
                .client
                .describe_table()
                .table_name(self.table_name.as_str())
                .send()
                .await?;
            let status = desc.table.and_then(|t| t.table_status);
            if status == Some(TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(TABLE_POLL_PERIOD).await;
        }
        Err(anyhow!(
            "table `{}` did not become active in time",
            self.table_name
        ))
    }

    /// Delete the lock table and wait until it is gone.
    pub async fn destroy(&self) -> anyhow::Result<()> {
        self.client
            .delete_table()
            .table_name(self.table_name.as_str())
            .send()
            .await?;

        for _ in 0..TABLE_POLL_ATTEMPTS {
            if !self.exists().await? {
                return Ok(());
            }
            tokio::time::sleep(TABLE_POLL_PERIOD).await;
        }
        Err(anyhow!("table `{}` was not deleted in time", self.table_name))
    }

    /// Whether the lock table currently exists.
    pub async fn exists(&self) -> anyhow::Result<bool> {
        let desc = self
            .client
            .describe_table()
            .table_name(self.table_name.as_str())
            .send()
            .await;
        match desc {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError {
                err:
                    DescribeTableError {
                        kind: DescribeTableErrorKind::ResourceNotFoundException(..),
                        ..
                    },
                ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
