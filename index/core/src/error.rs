//! Status codes surfaced by hash table mutations.
//!
//! These are statuses the caller must act on, not internal failures.
//! Invariant violations (lock not held, operating on an inactive table,
//! a chain entry that should exist but does not) are logic errors and
//! panic instead of returning a status.

use std::fmt;

/// Outcome of a mutation against the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Key absent in the hash table. Also the historical sentinel returned
    /// by [`HashTable::insert_from_warmup`](crate::HashTable::insert_from_warmup)
    /// on success, meaning "nothing for the front-end to do".
    NotFound,

    /// CAS mismatch on a warmup insert or an explicit CAS precondition.
    InvalidCas,

    /// Mutation succeeded; the entry was clean beforehand.
    WasClean,

    /// Mutation succeeded; the entry was already dirty (pending flush).
    WasDirty,

    /// Entry is temporarily locked.
    IsLocked,

    /// Allocation failed while storing the item.
    NoMem,

    /// Entry is non-resident and the caller needs the value; a background
    /// fetch must be scheduled before retrying.
    NeedBgFetch,

    /// A prepared sync write is in flight for this key and blocks the
    /// requested mutation until it commits or aborts.
    IsPendingSyncWrite,
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NotFound"),
            Self::InvalidCas => write!(f, "InvalidCas"),
            Self::WasClean => write!(f, "WasClean"),
            Self::WasDirty => write!(f, "WasDirty"),
            Self::IsLocked => write!(f, "IsLocked"),
            Self::NoMem => write!(f, "NoMem"),
            Self::NeedBgFetch => write!(f, "NeedBgFetch"),
            Self::IsPendingSyncWrite => write!(f, "IsPendingSyncWrite"),
        }
    }
}

impl std::error::Error for MutationStatus {}

/// Outcome of a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    /// The entry is now deleted.
    Success,

    /// The entry is a prepared sync write; it cannot be soft deleted in
    /// place.
    IsPendingSyncWrite,
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::IsPendingSyncWrite => write!(f, "IsPendingSyncWrite"),
        }
    }
}

impl std::error::Error for DeletionStatus {}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_status_display() {
        assert_eq!(MutationStatus::NotFound.to_string(), "NotFound");
        assert_eq!(MutationStatus::WasClean.to_string(), "WasClean");
        assert_eq!(
            MutationStatus::IsPendingSyncWrite.to_string(),
            "IsPendingSyncWrite"
        );
    }

    #[test]
    fn test_deletion_status_display() {
        assert_eq!(DeletionStatus::Success.to_string(), "Success");
        assert_eq!(
            DeletionStatus::IsPendingSyncWrite.to_string(),
            "IsPendingSyncWrite"
        );
    }

    #[test]
    fn test_statuses_are_error_types() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<MutationStatus>();
        assert_error::<DeletionStatus>();
    }
}
