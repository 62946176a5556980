//! In-memory store for tests and demonstrations.

use crate::store::{Condition, LockRecord, LockSnapshot, LockStore, StoreError};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRecord {
    version: Uuid,
    lease_duration: u64,
    host: String,
}

/// Single-process [`LockStore`] backed by a mutex-guarded map.
///
/// Conditions are evaluated while holding the map lock, so writes are
/// trivially linearizable per key. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        <_>::default()
    }

    /// Number of records currently stored. Test aid.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn put(
        &self,
        record: &LockRecord,
        condition: Option<&Condition>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let stored = records.get(&record.name).map(|r| r.version);
        if let Some(cond) = condition {
            if !cond.holds_for(stored) {
                return Err(StoreError::ConditionFailed);
            }
        }
        records.insert(
            record.name.clone(),
            StoredRecord {
                version: record.version,
                lease_duration: record.lease_duration,
                host: record.host.clone(),
            },
        );
        Ok(())
    }

    async fn update_version(
        &self,
        name: &str,
        new_version: Uuid,
        condition: Option<&Condition>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(name) {
            None => Err(StoreError::NoSuchRecord),
            Some(record) => {
                if let Some(cond) = condition {
                    if !cond.holds_for(Some(record.version)) {
                        return Err(StoreError::ConditionFailed);
                    }
                }
                record.version = new_version;
                Ok(())
            }
        }
    }

    async fn delete(&self, name: &str, condition: Option<&Condition>) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        match records.get(name) {
            None => Err(StoreError::NoSuchRecord),
            Some(record) => {
                if let Some(cond) = condition {
                    if !cond.holds_for(Some(record.version)) {
                        return Err(StoreError::ConditionFailed);
                    }
                }
                records.remove(name);
                Ok(())
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<LockSnapshot>, StoreError> {
        let records = self.records.lock().unwrap();
        Ok(records.get(name).map(|r| LockSnapshot {
            version: r.version,
            lease_duration: r.lease_duration,
            host: r.host.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: Uuid) -> LockRecord {
        LockRecord {
            name: name.into(),
            version,
            lease_duration: 20,
            host: "test-host".into(),
        }
    }

    #[tokio::test]
    async fn conditional_put_guards_existing_record() {
        let store = MemoryStore::new();
        let v1 = Uuid::new_v4();

        store
            .put(&record("a", v1), Some(&Condition::lock_free()))
            .await
            .unwrap();

        // A second free-guarded put must fail.
        let err = store
            .put(&record("a", Uuid::new_v4()), Some(&Condition::lock_free()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));

        // A steal-guarded put against the stored version succeeds.
        let v2 = Uuid::new_v4();
        store
            .put(&record("a", v2), Some(&Condition::lock_free_or_expired(v1)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().version, v2);
    }

    #[tokio::test]
    async fn update_and_delete_on_absent_record() {
        let store = MemoryStore::new();
        let v = Uuid::new_v4();

        let err = store
            .update_version("missing", v, Some(&Condition::we_own_lock(v)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchRecord));

        let err = store
            .delete("missing", Some(&Condition::we_own_lock(v)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchRecord));
    }

    #[tokio::test]
    async fn delete_requires_matching_version() {
        let store = MemoryStore::new();
        let v = Uuid::new_v4();
        store.put(&record("a", v), None).await.unwrap();

        let err = store
            .delete("a", Some(&Condition::we_own_lock(Uuid::new_v4())))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));

        store
            .delete("a", Some(&Condition::we_own_lock(v)))
            .await
            .unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }
}
