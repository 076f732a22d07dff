//! Pause-resumable hash table visitation.

use crate::hash_table::HashBucketLock;
use crate::stored_value::StoredValue;
use std::fmt;

/// Decision returned by a content visitor after each stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// Keep visiting.
    Continue,
    /// Stop here; the caller may resume later from the returned position.
    Pause,
}

/// Content visitor: receives one `(bucket lock, stored value)` pair at a
/// time. Used for eviction scans, expiry, tombstone purging, and backfill
/// feeding.
///
/// The visitor runs with the bucket's stripe lock held and must not call
/// back into the hash table for the same bucket.
pub trait HashTableVisitor {
    /// Called before each hash bucket is visited, outside the bucket
    /// lock. Visitors needing additional locking acquire it here.
    fn set_up_hash_bucket_visit(&mut self) {}

    /// Visit one stored value.
    fn visit(&mut self, lock: &HashBucketLock<'_>, sv: &mut StoredValue) -> VisitOutcome;

    /// Called after each hash bucket, once the bucket lock is released.
    fn tear_down_hash_bucket_visit(&mut self) {}
}

/// Depth visitor: receives per-chain aggregates for diagnostic sizing.
pub trait HashTableDepthVisitor {
    /// Report one bucket's chain length and total stored-value bytes.
    fn visit(&mut self, bucket: usize, depth: usize, mem: usize);
}

/// Resume position for a pause-resumable visit.
///
/// A position is only meaningful against the table size it was taken at;
/// if the table has resized since, iteration restarts from the position's
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Table size the position was recorded at.
    pub ht_size: usize,
    /// Outer iteration index (stripe lock).
    pub lock: usize,
    /// Inner iteration index (hash bucket).
    pub hash_bucket: usize,
}

impl Position {
    /// Start of iteration.
    pub fn begin() -> Self {
        Self::default()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{lock:{} bucket:{}/{}}}",
            self.lock, self.hash_bucket, self.ht_size
        )
    }
}
