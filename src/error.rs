use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by lock operations.
///
/// Store failures that are not part of the locking protocol itself
/// propagate unchanged inside [`LockError::Store`].
#[derive(Debug, Error)]
pub enum LockError {
    /// The acquisition deadline elapsed before the lock could be taken.
    ///
    /// Recoverable: the caller may retry with fresh parameters.
    #[error("lock not granted within the allowed wait time")]
    NotGranted,

    /// Our asserted ownership was invalidated: a conditional refresh or
    /// release found a version we did not write.
    ///
    /// Not recoverable for this lock instance. The protected resource
    /// may have been acted on by another holder.
    #[error("lock ownership was lost")]
    Lost,

    /// The operation referenced a lock name this instance does not hold.
    #[error("no such lock held by this instance")]
    NoSuchLock,

    /// The serialized form was malformed or of an unsupported version.
    #[error("cannot deserialize lock: {0}")]
    CannotDeserialize(String),

    /// Encoding a lock for handoff failed.
    #[error("failed to serialize lock")]
    Serialize(#[source] serde_json::Error),

    /// An unclassified backing-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
