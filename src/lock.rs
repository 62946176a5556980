//! User-facing lock handles.

use crate::{error::LockError, lease::VersionLease, refresher::Refresher};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// Lease length used by [`LockHandle::acquire`], in seconds.
pub const DEFAULT_LEASE_DURATION: u64 = 20;
/// Acquisition wait limit used by [`LockHandle::acquire`].
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Background refreshes run at this fraction of the lease duration,
/// leaving slack for latency and retries before the lease lapses.
const REFRESH_PERIOD_RATIO: f64 = 3.0 / 4.0;

pub(crate) const ENVELOPE_FORMAT_ID: &str = "LockHandle.v1";

/// Serialized form of a [`LockHandle`]: the lock name plus the inner
/// lease payload, itself a self-describing JSON string.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HandleEnvelope {
    pub envelope_id: String,
    pub name: String,
    pub technique: String,
}

/// A named lock bound to a [`VersionLease`] engine.
///
/// Handles are created by a [`Session`](crate::Session). A handle is meant
/// to be driven by one task at a time; the background refresher talks to
/// the shared engine, not to the handle.
///
/// Dropping a handle signals its refresher to stop but does not release
/// the lock; the lease then lapses on its own schedule. Call
/// [`LockHandle::release`] (or use [`LockHandle::scoped`]) for prompt
/// release.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    lease: Arc<VersionLease>,
    auto_refresh: bool,
    refresher: Option<Refresher>,
    /// Set by the background refresher when it observes ownership loss.
    lost: Arc<AtomicBool>,
}

impl LockHandle {
    pub(crate) fn new(name: String, lease: Arc<VersionLease>, auto_refresh: bool) -> Self {
        Self {
            name,
            lease,
            auto_refresh,
            refresher: None,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire with the default lease ([`DEFAULT_LEASE_DURATION`]) and
    /// wait limit ([`DEFAULT_MAX_WAIT`]).
    pub async fn acquire(&mut self) -> Result<(), LockError> {
        self.acquire_with(DEFAULT_LEASE_DURATION, DEFAULT_MAX_WAIT).await
    }

    /// Acquire for `lease_duration` seconds, waiting up to `max_wait`.
    ///
    /// On success a background refresher is started (unless auto-refresh
    /// is off or the lease is zero), renewing the lease at 3/4 of its
    /// duration until release.
    pub async fn acquire_with(
        &mut self,
        lease_duration: u64,
        max_wait: Duration,
    ) -> Result<(), LockError> {
        // A leftover refresher from an earlier acquisition must not keep
        // refreshing whatever version it knew about.
        self.stop_refresher().await;
        self.lease.acquire(&self.name, lease_duration, max_wait).await?;
        self.lost.store(false, Ordering::SeqCst);
        if self.auto_refresh {
            self.start_refresher(lease_duration);
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// Stops the background refresher and waits for its acknowledgement
    /// before deleting the record, so no refresh can race the delete.
    pub async fn release(&mut self) -> Result<(), LockError> {
        self.stop_refresher().await;
        if self.lost.load(Ordering::SeqCst) {
            return Err(LockError::Lost);
        }
        self.lease.release(&self.name).await
    }

    /// Refresh the lock once, resetting its lease clock.
    ///
    /// Not normally needed while auto-refresh is active.
    pub async fn refresh(&self) -> Result<(), LockError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(LockError::Lost);
        }
        self.lease.refresh(&self.name).await
    }

    /// Run `body` while holding the lock.
    ///
    /// Acquires first; a failed acquisition propagates without any release
    /// attempt. After `body` completes the lock is released, and if the
    /// scope unwinds instead, a spawned task releases it in the
    /// background.
    pub async fn scoped<T, F, Fut>(
        &mut self,
        lease_duration: u64,
        max_wait: Duration,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_with(lease_duration, max_wait).await?;
        let mut backstop = ReleaseBackstop {
            lease: Arc::clone(&self.lease),
            name: self.name.clone(),
            armed: true,
        };
        let out = body().await;
        backstop.armed = false;
        drop(backstop);
        self.release().await?;
        Ok(out)
    }

    /// Serialize the handle for handoff to another host.
    ///
    /// Stops the refresher, performs one refresh so the recipient
    /// receives the widest possible lease window, and encodes the
    /// envelope as UTF-8 JSON. After a successful call this handle should
    /// be considered surrendered: the recipient's first refresh
    /// invalidates our version.
    pub async fn serialize(&mut self) -> Result<String, LockError> {
        self.stop_refresher().await;
        if self.lost.load(Ordering::SeqCst) {
            return Err(LockError::Lost);
        }
        self.lease.refresh(&self.name).await?;
        let envelope = HandleEnvelope {
            envelope_id: ENVELOPE_FORMAT_ID.to_owned(),
            name: self.name.clone(),
            technique: self.lease.serialize()?,
        };
        serde_json::to_string(&envelope).map_err(LockError::Serialize)
    }

    fn start_refresher(&mut self, lease_duration: u64) {
        let period = Duration::from_secs_f64(lease_duration as f64 * REFRESH_PERIOD_RATIO);
        if period.is_zero() {
            // A zero lease expires immediately; there is nothing for a
            // refresher to keep alive.
            return;
        }
        let lease = Arc::clone(&self.lease);
        let name = self.name.clone();
        let lost = Arc::clone(&self.lost);
        let mut refresher = Refresher::new(
            move || {
                let lease = Arc::clone(&lease);
                let name = name.clone();
                let lost = Arc::clone(&lost);
                async move {
                    match lease.refresh(&name).await {
                        Err(LockError::Lost) => {
                            lost.store(true, Ordering::SeqCst);
                            Err(LockError::Lost)
                        }
                        other => other,
                    }
                }
            },
            period,
        );
        refresher.start();
        self.refresher = Some(refresher);
    }

    async fn stop_refresher(&mut self) {
        if let Some(mut refresher) = self.refresher.take() {
            refresher.stop();
            refresher.join().await;
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop();
        }
    }
}

/// Releases the lock from `Drop` if a scope unwinds before its explicit
/// release.
struct ReleaseBackstop {
    lease: Arc<VersionLease>,
    name: String,
    armed: bool,
}

impl Drop for ReleaseBackstop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lease = Arc::clone(&self.lease);
        let name = std::mem::take(&mut self.name);
        tokio::spawn(async move {
            if let Err(err) = lease.release(&name).await {
                debug!(%err, name = %name, "backstop release failed");
            }
        });
    }
}
