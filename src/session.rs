//! Session: the factory binding locks to a store and a host identity.

use crate::{
    error::LockError,
    lease::VersionLease,
    lock::{HandleEnvelope, LockHandle, ENVELOPE_FORMAT_ID},
    store::LockStore,
};
use std::sync::Arc;

/// Creates [`LockHandle`]s bound to one store and host identifier.
///
/// The host identifier is written into lock records as a debugging aid;
/// it plays no part in the protocol. It defaults to the machine hostname.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn LockStore>,
    host: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Returns a new [`Session`] builder.
    pub fn builder() -> SessionBuilder {
        <_>::default()
    }

    /// A session with the default host identifier.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::builder().build(store)
    }

    pub fn host_identifier(&self) -> &str {
        &self.host
    }

    /// Create a handle for the named lock.
    ///
    /// With `auto_refresh` the handle renews its lease in a background
    /// task while held; without it the caller owns refreshing.
    ///
    /// Each handle gets its own lease engine, so handles are independent
    /// even for the same name.
    pub fn create_lock(&self, name: impl Into<String>, auto_refresh: bool) -> LockHandle {
        let lease = VersionLease::new(Arc::clone(&self.store), self.host.clone());
        LockHandle::new(name.into(), Arc::new(lease), auto_refresh)
    }

    /// Rebuild a lock handle serialized by [`LockHandle::serialize`],
    /// taking over its lease.
    ///
    /// The rebuilt handle refreshes immediately: this both confirms the
    /// handed-over ownership and restarts the lease clock, after which
    /// the sender's stale copy can no longer refresh or release.
    /// `auto_refresh` applies to the handle's future acquisitions, as in
    /// [`Session::create_lock`].
    pub async fn deserialize_lock(
        &self,
        serialized: &str,
        auto_refresh: bool,
    ) -> Result<LockHandle, LockError> {
        let envelope: HandleEnvelope = serde_json::from_str(serialized)
            .map_err(|err| LockError::CannotDeserialize(format!("invalid lock envelope: {err}")))?;
        if envelope.envelope_id != ENVELOPE_FORMAT_ID {
            return Err(LockError::CannotDeserialize(format!(
                "unsupported lock envelope `{}`, expected `{ENVELOPE_FORMAT_ID}`",
                envelope.envelope_id
            )));
        }

        let lease = VersionLease::from_serialized(
            &envelope.technique,
            Arc::clone(&self.store),
            self.host.clone(),
        )?;
        let handle = LockHandle::new(envelope.name, Arc::new(lease), auto_refresh);
        handle.refresh().await?;
        Ok(handle)
    }
}

/// [`Session`] builder.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    host_identifier: Option<String>,
}

impl SessionBuilder {
    /// Sets the host identifier recorded in lock entries.
    ///
    /// Default: the machine hostname.
    pub fn host_identifier(mut self, host: impl Into<String>) -> Self {
        self.host_identifier = Some(host.into());
        self
    }

    /// Builds a [`Session`] over the given store.
    pub fn build(self, store: Arc<dyn LockStore>) -> Session {
        let host = self
            .host_identifier
            .unwrap_or_else(default_host_identifier);
        Session { store, host }
    }
}

fn default_host_identifier() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_owned())
}
