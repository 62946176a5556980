//! Backing-store abstraction for lock records.
//!
//! The locking protocol depends on exactly four store operations, all
//! expressed here. Implementations **must** provide per-key linearizable
//! conditional writes and strongly consistent reads: the version number is
//! the only mechanism providing mutual exclusion, and a store with weaker
//! conditional-write semantics breaks it.

mod condition;
pub mod dynamodb;
pub mod memory;

pub use condition::Condition;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// A lock record as written to the backing store.
///
/// One record exists per lock name; the name is the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Logical resource identifier chosen by clients.
    pub name: String,
    /// Fencing token. Replaced on every successful write.
    pub version: Uuid,
    /// Seconds the holder may stay silent before the lease is considered
    /// expired. Advisory wait hint, never compared against wall clocks.
    pub lease_duration: u64,
    /// Identifies the acquirer. Debugging aid only.
    pub host: String,
}

/// The attribute view of a stored record returned by [`LockStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub version: Uuid,
    pub lease_duration: u64,
    pub host: String,
}

/// Store-level failures.
///
/// The two sentinel kinds are part of the locking protocol; everything
/// else is opaque and propagates unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write's precondition was not met.
    #[error("store condition failed")]
    ConditionFailed,

    /// The referenced record (or its backing table) does not exist.
    #[error("no such record")]
    NoSuchRecord,

    /// Any other store failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Conditional single-item operations over lock records.
///
/// Implementations must be `Send + Sync`; a single store handle is shared
/// by all locks of a session and by their background refreshers.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write a full record, atomically checking `condition` if present.
    async fn put(&self, record: &LockRecord, condition: Option<&Condition>)
        -> Result<(), StoreError>;

    /// Replace the stored version for `name`, atomically checking
    /// `condition` if present.
    async fn update_version(
        &self,
        name: &str,
        new_version: Uuid,
        condition: Option<&Condition>,
    ) -> Result<(), StoreError>;

    /// Delete the record for `name`, atomically checking `condition` if
    /// present.
    async fn delete(&self, name: &str, condition: Option<&Condition>) -> Result<(), StoreError>;

    /// Strongly consistent read of the record for `name`, or `None` if no
    /// record exists.
    async fn get(&self, name: &str) -> Result<Option<LockSnapshot>, StoreError>;
}
