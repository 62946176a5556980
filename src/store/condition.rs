use uuid::Uuid;

/// A predicate attached to a conditional store write.
///
/// The locking protocol never constructs store-specific condition syntax;
/// it speaks in these predicates and each backend translates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// No record exists for the key.
    Free,
    /// A record exists and its version equals the given one.
    VersionIs(Uuid),
    /// Either no record exists, or its version equals the given one.
    FreeOrVersionIs(Uuid),
}

impl Condition {
    /// The lock is currently free: no record exists.
    pub fn lock_free() -> Self {
        Condition::Free
    }

    /// The lock has expired: the version we observed on a failed write is
    /// still in place, so the holder made no progress for a full lease
    /// duration and the lease must have elapsed.
    pub fn lock_expired(observed: Uuid) -> Self {
        Condition::VersionIs(observed)
    }

    /// The lock is free, or expired with the observed version still in
    /// place. The steal precondition.
    pub fn lock_free_or_expired(observed: Uuid) -> Self {
        Condition::FreeOrVersionIs(observed)
    }

    /// We own the lock: the stored version is the one we last wrote.
    ///
    /// Same shape as [`Condition::lock_expired`], but asserted about our
    /// own version as the precondition for refresh and release.
    pub fn we_own_lock(version: Uuid) -> Self {
        Condition::VersionIs(version)
    }

    /// Evaluate the predicate against the version currently stored for the
    /// key, if any.
    pub fn holds_for(&self, stored: Option<Uuid>) -> bool {
        match (self, stored) {
            (Condition::Free, None) => true,
            (Condition::Free, Some(_)) => false,
            (Condition::VersionIs(v), Some(current)) => *v == current,
            (Condition::VersionIs(_), None) => false,
            (Condition::FreeOrVersionIs(_), None) => true,
            (Condition::FreeOrVersionIs(v), Some(current)) => *v == current,
        }
    }
}
