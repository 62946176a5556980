//! The version-lease protocol.
//!
//! Every lock record carries a version, a fresh UUID written by whichever
//! host last touched the record. All state-changing writes are conditional
//! on the previously observed version, so the store's per-key
//! linearization decides every race. A host "holds" a lock exactly while
//! its locally remembered version matches the stored one.
//!
//! Waiting is driven purely by lease durations read from the contended
//! record: a contender sleeps the full advertised lease and then attempts
//! a conditional steal against the version it observed. If the holder made
//! any progress in the meantime the stored version has moved and the steal
//! loses. Only monotonic local time is used; clocks are never compared
//! across hosts.

use crate::{
    error::LockError,
    store::{Condition, LockRecord, LockStore, StoreError},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

const PAYLOAD_FORMAT_ID: &str = "VersionLease.v1";

/// Serialized form of a [`VersionLease`]'s held versions.
///
/// Keys are sorted so the encoding is stable across hosts.
#[derive(Debug, Serialize, Deserialize)]
struct LeasePayload {
    format_id: String,
    versions: BTreeMap<String, Uuid>,
}

/// State machine for acquiring, refreshing, stealing and releasing
/// version-leased locks against a [`LockStore`].
///
/// One instance serves any number of lock names; the per-name versions it
/// has written are the instance's only state. Methods take `&self` and the
/// version map is internally guarded, so an instance can be shared between
/// user code and background refreshers.
pub struct VersionLease {
    store: Arc<dyn LockStore>,
    host: String,
    versions: Mutex<HashMap<String, Uuid>>,
}

impl std::fmt::Debug for VersionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionLease")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl VersionLease {
    pub fn new(store: Arc<dyn LockStore>, host: impl Into<String>) -> Self {
        Self {
            store,
            host: host.into(),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// The version this instance last wrote for `name`, if it holds it.
    pub fn version_of(&self, name: &str) -> Option<Uuid> {
        self.versions.lock().unwrap().get(name).copied()
    }

    /// Names currently held by this instance.
    pub fn held_names(&self) -> Vec<String> {
        self.versions.lock().unwrap().keys().cloned().collect()
    }

    /// Acquire `name` for `lease_duration` seconds, waiting up to
    /// `max_wait` for the current holder to release or lapse.
    ///
    /// `name` must be non-empty. A `lease_duration` of `0` is legal and
    /// means the lease expires immediately. Fails with
    /// [`LockError::NotGranted`] once the deadline makes success
    /// impossible; no partial state is written in that case.
    #[instrument(skip_all)]
    pub async fn acquire(
        &self,
        name: &str,
        lease_duration: u64,
        max_wait: Duration,
    ) -> Result<(), LockError> {
        debug_assert!(!name.is_empty(), "lock names must be non-empty");
        let start = Instant::now();

        let version = Uuid::new_v4();
        match self
            .store
            .put(
                &self.record(name, version, lease_duration),
                Some(&Condition::lock_free()),
            )
            .await
        {
            Ok(()) => {
                self.remember(name, version);
                Ok(())
            }
            Err(StoreError::ConditionFailed) => {
                let (prior_lease, prior_version) = self.observe(name).await?;
                self.steal(name, lease_duration, max_wait, prior_lease, prior_version, start)
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Steal loop: wait out the observed lease, then write conditionally
    /// on the observed version. Re-observe and repeat on every lost race
    /// until the deadline rules success out.
    async fn steal(
        &self,
        name: &str,
        lease_duration: u64,
        max_wait: Duration,
        mut prior_lease: u64,
        mut prior_version: Option<Uuid>,
        start: Instant,
    ) -> Result<(), LockError> {
        loop {
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return Err(LockError::NotGranted);
            }
            let next_wait = Duration::from_secs(prior_lease);
            // The steal chance only arrives once the full observed lease
            // has passed; if that lands beyond the deadline, give up now
            // rather than sleeping into it.
            if next_wait > max_wait - elapsed {
                return Err(LockError::NotGranted);
            }
            debug!(name, wait_secs = prior_lease, "waiting out holder lease");
            tokio::time::sleep(next_wait).await;

            let version = Uuid::new_v4();
            let condition = match prior_version {
                Some(observed) => Condition::lock_free_or_expired(observed),
                None => Condition::lock_free(),
            };
            match self
                .store
                .put(&self.record(name, version, lease_duration), Some(&condition))
                .await
            {
                Ok(()) => {
                    self.remember(name, version);
                    return Ok(());
                }
                Err(StoreError::ConditionFailed) => {
                    let (lease, observed) = self.observe(name).await?;
                    prior_lease = lease;
                    prior_version = observed;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Release `name` by deleting its record, conditional on still owning
    /// it.
    ///
    /// A record that is already gone counts as released. A failed
    /// ownership check is [`LockError::Lost`]; either way the local entry
    /// is dropped, since we cannot claim to hold what we do not own.
    #[instrument(skip_all)]
    pub async fn release(&self, name: &str) -> Result<(), LockError> {
        let version = self.version_of(name).ok_or(LockError::NoSuchLock)?;
        match self
            .store
            .delete(name, Some(&Condition::we_own_lock(version)))
            .await
        {
            Ok(()) => {
                self.forget(name);
                Ok(())
            }
            Err(StoreError::NoSuchRecord) => {
                self.forget(name);
                Ok(())
            }
            Err(StoreError::ConditionFailed) => {
                self.forget(name);
                Err(LockError::Lost)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Refresh `name` by swapping in a fresh version, conditional on still
    /// owning it. Resets the holder's lease clock as observed by
    /// contenders.
    #[instrument(skip_all)]
    pub async fn refresh(&self, name: &str) -> Result<(), LockError> {
        let old_version = self.version_of(name).ok_or(LockError::NoSuchLock)?;
        let new_version = Uuid::new_v4();
        match self
            .store
            .update_version(name, new_version, Some(&Condition::we_own_lock(old_version)))
            .await
        {
            Ok(()) => {
                self.remember(name, new_version);
                Ok(())
            }
            // A changed or vanished record both mean the same thing here:
            // somebody else moved the lock on from the version we wrote.
            Err(StoreError::ConditionFailed) | Err(StoreError::NoSuchRecord) => {
                self.forget(name);
                Err(LockError::Lost)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Encode the held-version map as a stable, self-describing UTF-8 JSON
    /// payload for lease handoff.
    pub fn serialize(&self) -> Result<String, LockError> {
        let versions: BTreeMap<String, Uuid> = self
            .versions
            .lock()
            .unwrap()
            .iter()
            .map(|(name, version)| (name.clone(), *version))
            .collect();
        let payload = LeasePayload {
            format_id: PAYLOAD_FORMAT_ID.to_owned(),
            versions,
        };
        serde_json::to_string(&payload).map_err(LockError::Serialize)
    }

    /// Rebuild an instance from a payload produced by
    /// [`VersionLease::serialize`] on another host.
    ///
    /// The recipient should refresh promptly: until it does, the sender's
    /// stale copy satisfies the ownership condition just as well.
    pub fn from_serialized(
        payload: &str,
        store: Arc<dyn LockStore>,
        host: impl Into<String>,
    ) -> Result<Self, LockError> {
        let payload: LeasePayload = serde_json::from_str(payload)
            .map_err(|err| LockError::CannotDeserialize(format!("invalid lease payload: {err}")))?;
        if payload.format_id != PAYLOAD_FORMAT_ID {
            return Err(LockError::CannotDeserialize(format!(
                "unsupported lease payload format `{}`, expected `{PAYLOAD_FORMAT_ID}`",
                payload.format_id
            )));
        }
        Ok(Self {
            store,
            host: host.into(),
            versions: Mutex::new(payload.versions.into_iter().collect()),
        })
    }

    /// Fetch the contended record's lease & version, treating a record
    /// that vanished since our failed write as "free, retry immediately".
    async fn observe(&self, name: &str) -> Result<(u64, Option<Uuid>), LockError> {
        match self.store.get(name).await? {
            Some(snapshot) => Ok((snapshot.lease_duration, Some(snapshot.version))),
            None => Ok((0, None)),
        }
    }

    fn record(&self, name: &str, version: Uuid, lease_duration: u64) -> LockRecord {
        LockRecord {
            name: name.to_owned(),
            version,
            lease_duration,
            host: self.host.clone(),
        }
    }

    fn remember(&self, name: &str, version: Uuid) {
        self.versions
            .lock()
            .unwrap()
            .insert(name.to_owned(), version);
    }

    fn forget(&self, name: &str) {
        self.versions.lock().unwrap().remove(name);
    }
}
