//! Distributed named locks with expiring leases, backed by any store that
//! offers per-key linearizable conditional writes (DynamoDB included).
//!
//! Each lock record carries a fencing version, a fresh UUID written on
//! every acquire/refresh/steal. A holder keeps its lease alive by
//! refreshing at a fraction of the lease duration; a contender that finds
//! the version unchanged after a full lease has passed may steal the
//! lock with a conditional write. Held locks can be serialized and handed
//! off to another process without ever being vacated in the store.
//!
//! # Example
//! ```
//! # use std::{sync::Arc, time::Duration};
//! # async fn demo() -> Result<(), verlease::LockError> {
//! use verlease::{store::memory::MemoryStore, Session};
//!
//! let session = Session::builder()
//!     .host_identifier("worker-1")
//!     .build(Arc::new(MemoryStore::new()));
//!
//! // acquire exclusive rights to "important-job-123";
//! // waits for any other holder to release or lapse
//! let mut lock = session.create_lock("important-job-123", true);
//! lock.acquire_with(20, Duration::from_secs(300)).await?;
//!
//! // `lock` refreshes its lease in a background tokio task
//!
//! // ... act on the protected resource ...
//!
//! lock.release().await?;
//! # Ok(()) }
//! ```
//!
//! For DynamoDB, build the store with
//! [`store::dynamodb::DynamoDbStore::connect`] and pass it to the session
//! the same way.

mod error;
mod lease;
mod lock;
mod refresher;
mod session;
pub mod store;

pub use error::LockError;
pub use lease::VersionLease;
pub use lock::{LockHandle, DEFAULT_LEASE_DURATION, DEFAULT_MAX_WAIT};
pub use refresher::Refresher;
pub use session::{Session, SessionBuilder};
