//! The concurrent, resizable document index for one vbucket partition.
//!
//! # Locking
//!
//! The table owns `L` stripe mutexes; hash bucket `b` is guarded by mutex
//! `b % L`. Every chain traversal or mutation holds its bucket's stripe
//! lock. Full-table operations ([`HashTable::clear`],
//! [`HashTable::resize_to`]) acquire all `L` mutexes in index order; that
//! is the only nested-lock scenario, and it is deadlock-free because it is
//! the only multi-lock caller.
//!
//! Statistics counters are relaxed atomics and deliberately not covered by
//! the stripe locks; snapshot reads may briefly disagree with a chain
//! walk.
//!
//! # Prepares
//!
//! A bucket chain holds at most one committed and at most one pending
//! (prepared sync write) entry per key; the two may coexist. Reads use
//! the committed entry unless a `PreparedMaybeVisible` prepare shadows
//! it; writes target the prepare when one exists.

use crate::config::HashTableConfig;
use crate::error::{DeletionStatus, MutationStatus};
use crate::factory::StoredValueFactory;
use crate::freq::ProbabilisticCounter;
use crate::item::{CommittedState, DeleteSource, Item};
use crate::key::DocKey;
use crate::stats::{EngineStats, Statistics};
use crate::stored_value::{EvictionPolicy, StoredValue, chain_remove_first};
use crate::sync::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::visitor::{HashTableDepthVisitor, HashTableVisitor, Position, VisitOutcome};
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// Bucket counts used by [`HashTable::resize`], primes chosen to keep the
/// modulo distribution well-behaved as the table grows.
const PRIME_SIZES: [usize; 30] = [
    3, 7, 13, 23, 47, 97, 193, 383, 769, 1531, 3079, 6143, 12289, 24571, 49157, 98299, 196613,
    393209, 786433, 1572869, 3145721, 6291449, 12582917, 25165813, 50331653, 100663291, 201326611,
    402653189, 805306357, 1610612741,
];

/// A held stripe lock for one hash bucket.
///
/// Bundles the mutex guard with the bucket index and table size observed
/// at acquisition. Callers must use [`bucket_num`](Self::bucket_num)
/// rather than recomputing the bucket, so an interleaved resize cannot
/// cause a torn read.
pub struct HashBucketLock<'a> {
    #[allow(dead_code)]
    guard: MutexGuard<'a, ()>,
    bucket: usize,
    ht_size: usize,
}

impl HashBucketLock<'_> {
    /// The hash bucket this lock covers.
    #[inline]
    pub fn bucket_num(&self) -> usize {
        self.bucket
    }

    /// The table size observed when the lock was taken. Stable for the
    /// lifetime of the lock.
    #[inline]
    pub fn ht_size(&self) -> usize {
        self.ht_size
    }
}

/// Whether a read should bump the access-frequency counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReference {
    /// Bump the frequency counter.
    Yes,
    /// Leave the item's hotness untouched.
    No,
}

/// Whether a lookup should surface tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantsDeleted {
    /// Return deleted entries.
    Yes,
    /// Hide deleted entries.
    No,
}

/// Result of a write-perspective lookup: the lock plus the entry to
/// mutate, if any.
///
/// The reference is only valid while `lock` is held; do not stash it past
/// the lock's scope.
pub struct FindResult<'a> {
    /// The held bucket lock.
    pub lock: HashBucketLock<'a>,
    /// The entry found, if any.
    pub stored_value: Option<&'a mut StoredValue>,
}

/// Result of a read-perspective lookup.
///
/// If the returned entry is a prepare in state `PreparedMaybeVisible`,
/// the read is blocked until the prepare resolves; the entry is returned
/// as that signal.
pub struct FindROResult<'a> {
    /// The held bucket lock.
    pub lock: HashBucketLock<'a>,
    /// The entry found, if any.
    pub stored_value: Option<&'a StoredValue>,
}

/// Result of [`HashTable::find_for_commit`]: both phases of a sync write.
pub struct FindCommitResult<'a> {
    /// The held bucket lock.
    pub lock: HashBucketLock<'a>,
    /// The prepare being committed. Present in correct use.
    pub pending: Option<&'a mut StoredValue>,
    /// The committed entry the prepare will replace, if one exists.
    pub committed: Option<&'a mut StoredValue>,
}

/// Result of an in-place update.
pub struct UpdateResult<'a> {
    /// What happened.
    pub status: MutationStatus,
    /// The updated entry; on `IsPendingSyncWrite` no update happened and
    /// this is `None`.
    pub stored_value: Option<&'a mut StoredValue>,
}

/// Result of a soft delete.
pub struct DeleteResult<'a> {
    /// What happened.
    pub status: DeletionStatus,
    /// The deleted entry; `None` when the delete was refused.
    pub deleted_value: Option<&'a mut StoredValue>,
}

struct FindInner<'a> {
    lock: HashBucketLock<'a>,
    committed: Option<*mut StoredValue>,
    pending: Option<*mut StoredValue>,
}

/// Decrements the in-flight visitor count on scope exit.
struct VisitorTracker<'a> {
    visitors: &'a AtomicUsize,
}

impl Drop for VisitorTracker<'_> {
    fn drop(&mut self) {
        self.visitors.fetch_sub(1, Ordering::SeqCst);
    }
}

type FreqSaturatedCallback = Box<dyn Fn() + Send + Sync>;

/// The in-memory document index: a chained hash table of
/// [`StoredValue`]s supporting concurrent readers and writers, online
/// resize, pause-resumable visitation, pluggable eviction, and the
/// dual-entry protocol of two-phase sync writes.
pub struct HashTable {
    initial_size: usize,
    size: AtomicUsize,
    mutexes: Box<[Mutex<()>]>,
    /// Bucket chain heads. Guarded by the stripe locks: slot `b` requires
    /// `mutexes[b % L]`, whole-vector operations require all of them.
    values: UnsafeCell<Vec<Option<Box<StoredValue>>>>,
    factory: Box<dyn StoredValueFactory>,
    engine_stats: Arc<EngineStats>,
    value_stats: Statistics,
    active: AtomicBool,
    /// Number of visitors mid-scan. Non-zero blocks resize.
    visitors: AtomicUsize,
    num_ejects: AtomicUsize,
    num_resizes: AtomicUsize,
    max_deleted_rev_seqno: AtomicU64,
    probabilistic_counter: ProbabilisticCounter,
    freq_saturated_cb: Option<FreqSaturatedCallback>,
}

// SAFETY: the bucket vector behind `UnsafeCell` is only touched while the
// owning stripe lock (or all of them) is held; everything else is atomics
// or Send + Sync already.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    /// Create a table with the given shared engine stats, stored value
    /// layout, and configuration.
    pub fn new(
        engine_stats: Arc<EngineStats>,
        factory: Box<dyn StoredValueFactory>,
        config: HashTableConfig,
    ) -> Self {
        assert!(config.initial_size > 0, "HashTable: initial_size must be non-zero");
        assert!(config.num_locks > 0, "HashTable: num_locks must be non-zero");

        let ht = Self {
            initial_size: config.initial_size,
            size: AtomicUsize::new(config.initial_size),
            mutexes: (0..config.num_locks).map(|_| Mutex::new(())).collect(),
            values: UnsafeCell::new((0..config.initial_size).map(|_| None).collect()),
            factory,
            value_stats: Statistics::new(Arc::clone(&engine_stats)),
            engine_stats,
            active: AtomicBool::new(true),
            visitors: AtomicUsize::new(0),
            num_ejects: AtomicUsize::new(0),
            num_resizes: AtomicUsize::new(0),
            max_deleted_rev_seqno: AtomicU64::new(0),
            probabilistic_counter: ProbabilisticCounter::new(config.freq_counter_inc_factor),
            freq_saturated_cb: None,
        };
        ht.engine_stats.add_mem_overhead(ht.memory_overhead() as isize);
        ht
    }

    /// Register the callback invoked when an access-frequency counter
    /// saturates (typically waking the frequency decayer task). The
    /// callback must be idempotent.
    pub fn set_freq_saturated_callback(&mut self, callback: FreqSaturatedCallback) {
        self.freq_saturated_cb = Some(callback);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Current number of hash buckets.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Number of stripe mutexes.
    #[inline]
    pub fn num_locks(&self) -> usize {
        self.mutexes.len()
    }

    /// Whether the table is accepting operations.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The per-table statistics.
    pub fn statistics(&self) -> &Statistics {
        &self.value_stats
    }

    /// Total ejections performed (both policies).
    pub fn num_ejects(&self) -> usize {
        self.num_ejects.load(Ordering::Relaxed)
    }

    /// Number of completed resizes.
    pub fn num_resizes(&self) -> usize {
        self.num_resizes.load(Ordering::Relaxed)
    }

    /// Highest revision seqno seen among fully-ejected or deleted
    /// entries.
    pub fn max_deleted_rev_seqno(&self) -> u64 {
        self.max_deleted_rev_seqno.load(Ordering::Relaxed)
    }

    /// Raise the deleted-revision watermark.
    pub fn update_max_deleted_rev_seqno(&self, seqno: u64) {
        self.max_deleted_rev_seqno.fetch_max(seqno, Ordering::Relaxed);
    }

    /// Index overhead in bytes: the record itself, the bucket vector and
    /// the lock array.
    pub fn memory_overhead(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.size() * std::mem::size_of::<Option<Box<StoredValue>>>()
            + self.mutexes.len() * std::mem::size_of::<Mutex<()>>()
    }

    /// Advance an access-frequency counter by one probabilistic step.
    pub fn generate_freq_value(&self, counter: u8) -> u8 {
        self.probabilistic_counter.generate_value(counter)
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Chain-head accessor.
    ///
    /// # Safety
    ///
    /// The caller must hold `mutexes[bucket % L]` (or all stripe locks),
    /// and `bucket` must be in range for the current size, which the lock
    /// pins.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bucket_head(&self, bucket: usize) -> &mut Option<Box<StoredValue>> {
        unsafe { &mut *(*self.values.get()).as_mut_ptr().add(bucket) }
    }

    /// Compute the key's bucket and lock it.
    ///
    /// The bucket index depends on the table size, which only changes
    /// under all stripe locks; holding one pins it. The loop re-checks
    /// the size observed before acquisition to defeat a resize that
    /// completed in between.
    pub fn lock_bucket(&self, key: &DocKey) -> HashBucketLock<'_> {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let bucket = key.hash() as usize % size;
            let guard = self.mutexes[bucket % self.mutexes.len()].lock();
            if self.size.load(Ordering::Acquire) == size {
                return HashBucketLock {
                    guard,
                    bucket,
                    ht_size: size,
                };
            }
        }
    }

    /// Lock a bucket by index, for visitors that iterate by stripe.
    ///
    /// Panics if `bucket` is out of range once the lock is held.
    pub fn lock_bucket_idx(&self, bucket: usize) -> HashBucketLock<'_> {
        let guard = self.mutexes[bucket % self.mutexes.len()].lock();
        let size = self.size.load(Ordering::Acquire);
        assert!(
            bucket < size,
            "HashTable::lock_bucket_idx: bucket {bucket} out of range for size {size}"
        );
        HashBucketLock {
            guard,
            bucket,
            ht_size: size,
        }
    }

    /// Acquire every stripe lock, in index order.
    fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.mutexes.iter().map(|m| m.lock()).collect()
    }

    /// Register a visitor: the increment happens under a stripe lock so
    /// it cannot race a resize, which holds all locks before checking the
    /// count.
    fn register_visitor(&self) -> VisitorTracker<'_> {
        let guard = self.mutexes[0].lock();
        self.visitors.fetch_add(1, Ordering::SeqCst);
        drop(guard);
        VisitorTracker {
            visitors: &self.visitors,
        }
    }

    #[inline]
    fn debug_assert_lock_matches(&self, lock: &HashBucketLock<'_>, sv: &StoredValue) {
        debug_assert_eq!(
            lock.bucket_num(),
            sv.key().hash() as usize % lock.ht_size(),
            "bucket lock does not guard this stored value's chain"
        );
    }

    // ------------------------------------------------------------------
    // Find primitives
    // ------------------------------------------------------------------

    fn find_inner(&self, key: &DocKey) -> FindInner<'_> {
        assert!(
            self.is_active(),
            "HashTable::find_inner: cannot call on a non-active object"
        );
        let lock = self.lock_bucket(key);

        let mut committed: Option<*mut StoredValue> = None;
        let mut pending: Option<*mut StoredValue> = None;

        // SAFETY: `lock` guards this bucket's chain.
        let head = unsafe { self.bucket_head(lock.bucket_num()) };
        let mut cur: *mut StoredValue = head
            .as_deref_mut()
            .map_or(ptr::null_mut(), |sv| sv as *mut StoredValue);
        while !cur.is_null() {
            // SAFETY: chain nodes are stable while the bucket lock is held.
            let sv = unsafe { &mut *cur };
            if sv.has_key(key) {
                if sv.is_pending() {
                    assert!(
                        pending.is_none(),
                        "HashTable::find_inner: multiple pending entries for {key:?}"
                    );
                    pending = Some(cur);
                } else {
                    assert!(
                        committed.is_none(),
                        "HashTable::find_inner: multiple committed entries for {key:?}"
                    );
                    committed = Some(cur);
                }
            }
            cur = sv
                .next_mut()
                .as_deref_mut()
                .map_or(ptr::null_mut(), |next| next as *mut StoredValue);
        }

        FindInner {
            lock,
            committed,
            pending,
        }
    }

    /// Look up the committed entry for reading.
    ///
    /// If a `PreparedMaybeVisible` prepare shadows the key, the prepare is
    /// returned instead as the signal that reads are blocked. Deleted
    /// entries are hidden unless `wants_deleted`. A successful non-deleted
    /// read bumps the frequency counter when `track_reference`.
    pub fn find_for_read(
        &self,
        key: &DocKey,
        track_reference: TrackReference,
        wants_deleted: WantsDeleted,
    ) -> FindROResult<'_> {
        let result = self.find_inner(key);

        if let Some(p) = result.pending {
            // SAFETY: result.lock guards the chain this pointer came from.
            let pending = unsafe { &mut *p };
            if pending.is_prepared_maybe_visible() {
                return FindROResult {
                    lock: result.lock,
                    stored_value: Some(pending),
                };
            }
        }

        let Some(c) = result.committed else {
            return FindROResult {
                lock: result.lock,
                stored_value: None,
            };
        };
        // SAFETY: as above.
        let sv = unsafe { &mut *c };

        if sv.is_deleted() {
            return FindROResult {
                lock: result.lock,
                stored_value: (wants_deleted == WantsDeleted::Yes).then_some(&*sv),
            };
        }

        if track_reference == TrackReference::Yes {
            self.update_freq_counter(sv);
        }

        FindROResult {
            lock: result.lock,
            stored_value: Some(sv),
        }
    }

    /// Look up the entry a write should target: the prepare if one is in
    /// flight, else the committed entry.
    ///
    /// A found prepare is always returned, regardless of deletion state
    /// or `wants_deleted` (a sync delete is itself a deleted prepare).
    pub fn find_for_write(&self, key: &DocKey, wants_deleted: WantsDeleted) -> FindResult<'_> {
        let result = self.find_inner(key);

        if let Some(p) = result.pending {
            // SAFETY: result.lock guards the chain this pointer came from.
            return FindResult {
                lock: result.lock,
                stored_value: Some(unsafe { &mut *p }),
            };
        }

        let Some(c) = result.committed else {
            return FindResult {
                lock: result.lock,
                stored_value: None,
            };
        };
        // SAFETY: as above.
        let sv = unsafe { &mut *c };

        if sv.is_deleted() && wants_deleted == WantsDeleted::No {
            return FindResult {
                lock: result.lock,
                stored_value: None,
            };
        }
        FindResult {
            lock: result.lock,
            stored_value: Some(sv),
        }
    }

    /// Look up both entries for the commit phase of a sync write.
    pub fn find_for_commit(&self, key: &DocKey) -> FindCommitResult<'_> {
        let result = self.find_inner(key);
        FindCommitResult {
            lock: result.lock,
            // SAFETY: result.lock guards the chain; the two pointers are
            // distinct nodes (at most one committed and one pending).
            pending: result.pending.map(|p| unsafe { &mut *p }),
            committed: result.committed.map(|c| unsafe { &mut *c }),
        }
    }

    /// Look up only the committed entry, ignoring any prepare.
    pub fn find_only_committed(&self, key: &DocKey) -> FindResult<'_> {
        let result = self.find_inner(key);
        FindResult {
            lock: result.lock,
            // SAFETY: result.lock guards the chain.
            stored_value: result.committed.map(|c| unsafe { &mut *c }),
        }
    }

    /// Look up only the prepared entry, ignoring any committed one.
    pub fn find_only_prepared(&self, key: &DocKey) -> FindResult<'_> {
        let result = self.find_inner(key);
        FindResult {
            lock: result.lock,
            // SAFETY: result.lock guards the chain.
            stored_value: result.pending.map(|p| unsafe { &mut *p }),
        }
    }

    // ------------------------------------------------------------------
    // Insert / update
    // ------------------------------------------------------------------

    /// Insert or update the item.
    pub fn set(&self, item: &Item) -> MutationStatus {
        let FindResult { lock, stored_value } = self.find_for_write(item.key(), WantsDeleted::Yes);
        match stored_value {
            Some(sv) => self.unlocked_update_stored_value(&lock, sv, item).status,
            None => {
                self.unlocked_add_new_stored_value(&lock, item);
                MutationStatus::WasClean
            }
        }
    }

    /// Replace an existing entry's contents with the item's.
    ///
    /// A prepare cannot be updated in place (`IsPendingSyncWrite`). A
    /// pending *item* against a committed entry allocates a second, new
    /// entry for the prepare instead, leaving the committed one intact.
    pub fn unlocked_update_stored_value<'a>(
        &'a self,
        lock: &HashBucketLock<'_>,
        sv: &'a mut StoredValue,
        item: &Item,
    ) -> UpdateResult<'a> {
        assert!(
            self.is_active(),
            "HashTable::unlocked_update_stored_value: cannot call on a non-active object"
        );
        self.debug_assert_lock_matches(lock, sv);

        if sv.is_pending() {
            return UpdateResult {
                status: MutationStatus::IsPendingSyncWrite,
                stored_value: None,
            };
        }

        if item.is_pending() {
            let prepare = self.unlocked_add_new_stored_value(lock, item);
            return UpdateResult {
                status: MutationStatus::WasClean,
                stored_value: Some(prepare),
            };
        }

        let status = if sv.is_dirty() {
            MutationStatus::WasDirty
        } else {
            MutationStatus::WasClean
        };

        let pre = self.value_stats.prologue(Some(sv));
        // set_value() un-deletes the entry if required.
        sv.set_value(item);
        self.update_freq_counter(sv);
        self.value_stats.epilogue(pre, Some(sv));

        UpdateResult {
            status,
            stored_value: Some(sv),
        }
    }

    /// Allocate a new entry for the item and link it at the head of its
    /// bucket chain.
    pub fn unlocked_add_new_stored_value<'a>(
        &'a self,
        lock: &HashBucketLock<'_>,
        item: &Item,
    ) -> &'a mut StoredValue {
        assert!(
            self.is_active(),
            "HashTable::unlocked_add_new_stored_value: cannot call on a non-active object"
        );

        let pre = self.value_stats.prologue(None);
        // SAFETY: `lock` guards this bucket's chain.
        let head = unsafe { self.bucket_head(lock.bucket_num()) };
        let sv = self.factory.create(item, head.take());
        self.value_stats.epilogue(pre, Some(&*sv));
        &mut **head.insert(sv)
    }

    /// Link an externally built entry (e.g. a sync-delete prepare) at the
    /// head of its bucket chain.
    pub fn unlocked_link<'a>(
        &'a self,
        lock: &HashBucketLock<'_>,
        mut sv: Box<StoredValue>,
    ) -> &'a mut StoredValue {
        assert!(
            self.is_active(),
            "HashTable::unlocked_link: cannot call on a non-active object"
        );
        self.debug_assert_lock_matches(lock, &sv);

        let pre = self.value_stats.prologue(None);
        // SAFETY: `lock` guards this bucket's chain.
        let head = unsafe { self.bucket_head(lock.bucket_num()) };
        sv.set_next(head.take());
        self.value_stats.epilogue(pre, Some(&*sv));
        &mut **head.insert(sv)
    }

    /// Release the entry matching `key` and insert a fresh copy of it,
    /// produced by the factory. Used when in-place mutation is unsafe,
    /// e.g. defragmenting a value during compaction.
    ///
    /// Returns the released entry and the new one.
    ///
    /// Panics if no entry matches (that is a logic error, as with
    /// [`unlocked_release`](Self::unlocked_release)).
    pub fn unlocked_replace_by_copy<'a>(
        &'a self,
        lock: &HashBucketLock<'_>,
        key: &DocKey,
    ) -> (Box<StoredValue>, &'a mut StoredValue) {
        assert!(
            self.is_active(),
            "HashTable::unlocked_replace_by_copy: cannot call on a non-active object"
        );

        let released = self.unlocked_release(lock, key);

        // SAFETY: `lock` guards this bucket's chain.
        let head = unsafe { self.bucket_head(lock.bucket_num()) };
        let copy = self.factory.copy(&released, head.take());

        let pre = self.value_stats.prologue(None);
        self.value_stats.epilogue(pre, Some(&*copy));

        (released, &mut **head.insert(copy))
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Soft-delete the entry: mark it as a tombstone, dropping the value
    /// unless `only_mark_deleted` (tombstone with body).
    ///
    /// Prepares are rejected with `IsPendingSyncWrite`; a sync delete
    /// goes through [`unlocked_create_sync_delete_prepare`](Self::unlocked_create_sync_delete_prepare).
    pub fn unlocked_soft_delete<'a>(
        &self,
        lock: &HashBucketLock<'_>,
        sv: &'a mut StoredValue,
        only_mark_deleted: bool,
        source: DeleteSource,
    ) -> DeleteResult<'a> {
        self.debug_assert_lock_matches(lock, sv);

        if sv.is_pending() {
            return DeleteResult {
                status: DeletionStatus::IsPendingSyncWrite,
                deleted_value: None,
            };
        }

        let pre = self.value_stats.prologue(Some(sv));
        if only_mark_deleted {
            sv.mark_deleted(source);
        } else {
            sv.del(source);
        }
        self.value_stats.epilogue(pre, Some(sv));

        DeleteResult {
            status: DeletionStatus::Success,
            deleted_value: Some(sv),
        }
    }

    /// Build (but do not link) the pending entry for a sync delete: a
    /// copy of `sv` in `Pending` state with the deletion applied. The
    /// caller links it with [`unlocked_link`](Self::unlocked_link).
    pub fn unlocked_create_sync_delete_prepare(
        &self,
        lock: &HashBucketLock<'_>,
        sv: &StoredValue,
        source: DeleteSource,
    ) -> Box<StoredValue> {
        self.debug_assert_lock_matches(lock, sv);

        let mut prepare = self.factory.copy(sv, None);
        prepare.set_committed(CommittedState::Pending);
        prepare.del(source);
        prepare
    }

    /// Hard-remove the entry matching `key` and drop it.
    ///
    /// Panics if no entry matches.
    pub fn unlocked_del(&self, lock: &HashBucketLock<'_>, key: &DocKey) {
        drop(self.unlocked_release(lock, key));
    }

    /// Hard-remove the given entry (by identity) and drop it.
    ///
    /// Panics if the entry is not on the chain.
    pub fn unlocked_del_sv(&self, lock: &HashBucketLock<'_>, sv: &StoredValue) {
        let target: *const StoredValue = sv;
        drop(self.unlocked_release_inner(lock, |v| ptr::eq(v, target)));
    }

    /// Unlink and return the entry matching `key`.
    ///
    /// Panics if no entry matches: the caller asserted one exists, so a
    /// miss means a table leak.
    pub fn unlocked_release(&self, lock: &HashBucketLock<'_>, key: &DocKey) -> Box<StoredValue> {
        self.unlocked_release_inner(lock, |sv| sv.has_key(key))
    }

    fn unlocked_release_inner<F>(&self, lock: &HashBucketLock<'_>, pred: F) -> Box<StoredValue>
    where
        F: FnMut(&StoredValue) -> bool,
    {
        assert!(
            self.is_active(),
            "HashTable::unlocked_release: cannot call on a non-active object"
        );

        // SAFETY: `lock` guards this bucket's chain.
        let head = unsafe { self.bucket_head(lock.bucket_num()) };
        let Some(released) = chain_remove_first(head, pred) else {
            panic!(
                "HashTable::unlocked_release: stored value not found in bucket {}; \
                 possible hash table leak",
                lock.bucket_num()
            );
        };

        let pre = self.value_stats.prologue(Some(&*released));
        self.value_stats.epilogue(pre, None);

        released
    }

    /// Remove the entry if it is a temp placeholder left behind by a
    /// background fetch that reported deleted/not-found. Returns whether
    /// it was removed.
    pub fn cleanup_if_temporary(&self, lock: &HashBucketLock<'_>, sv: &StoredValue) -> bool {
        if sv.is_temp_deleted_item() || sv.is_temp_non_existent_item() {
            let key = sv.key().clone();
            self.unlocked_del(lock, &key);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Warmup
    // ------------------------------------------------------------------

    /// Insert an item loaded from persistence at startup.
    ///
    /// Returns `NotFound` on success: a historical sentinel meaning
    /// "nothing for the front-end to do", which the warmup caller chain
    /// depends on. `InvalidCas` reports a CAS conflict with an existing
    /// entry (or a meta-only load over an existing entry).
    pub fn insert_from_warmup(
        &self,
        item: &Item,
        eject: bool,
        key_meta_data_only: bool,
        eviction_policy: EvictionPolicy,
    ) -> MutationStatus {
        let result = self.find_inner(item.key());
        let lock = result.lock;
        let found = if item.is_committed() {
            result.committed
        } else {
            result.pending
        };

        match found {
            None => {
                let sv = self.unlocked_add_new_stored_value(&lock, item);
                if key_meta_data_only {
                    let pre = self.value_stats.prologue(Some(sv));
                    sv.mark_not_resident();
                    self.value_stats.epilogue(pre, Some(sv));
                }
                sv.set_new_cache_item(false);
                sv.mark_clean();
                if eject && !key_meta_data_only {
                    self.unlocked_eject_item(&lock, sv, eviction_policy);
                }
            }
            Some(v) => {
                // SAFETY: `lock` guards the chain this pointer came from.
                let sv = unsafe { &mut *v };

                if key_meta_data_only {
                    // There is no better error code for "slot already
                    // occupied during a meta-only load".
                    return MutationStatus::InvalidCas;
                }

                // An existing entry is either a temp placeholder from a
                // front-end read that triggered the fetch, or the result
                // of a previous fetch with the same CAS.
                if sv.cas() != item.cas() {
                    if sv.cas() == 0 {
                        sv.set_cas(item.cas());
                        sv.set_flags(item.flags());
                        sv.set_exptime(item.exptime());
                        sv.set_rev_seqno(item.rev_seqno());
                    } else {
                        return MutationStatus::InvalidCas;
                    }
                }

                if !sv.is_resident() {
                    let restored = self.unlocked_restore_value(&lock, item, sv);
                    assert!(
                        restored,
                        "HashTable::insert_from_warmup: failed to restore resident value"
                    );
                }
                sv.mark_clean();
                if eject && !key_meta_data_only {
                    self.unlocked_eject_item(&lock, sv, eviction_policy);
                }
            }
        }

        MutationStatus::NotFound
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Evict the entry under the given policy.
    ///
    /// Value eviction drops the value buffer and keeps the metadata
    /// resident; full eviction removes the entry from the chain entirely.
    /// Returns false (and counts a failed ejection) if the entry is
    /// ineligible.
    ///
    /// After a successful `Full` ejection the entry no longer exists; the
    /// `sv` reference must not be used again.
    pub fn unlocked_eject_item(
        &self,
        lock: &HashBucketLock<'_>,
        sv: &mut StoredValue,
        policy: EvictionPolicy,
    ) -> bool {
        self.debug_assert_lock_matches(lock, sv);

        if !sv.eligible_for_eviction(policy) {
            self.engine_stats.incr_failed_ejects();
            return false;
        }

        let pre = self.value_stats.prologue(Some(sv));

        match policy {
            EvictionPolicy::Value => {
                sv.eject_value();
                self.engine_stats.incr_value_ejects();
                self.value_stats.epilogue(pre, Some(sv));
            }
            EvictionPolicy::Full => {
                let target: *const StoredValue = sv;
                // SAFETY: `lock` guards this bucket's chain.
                let head = unsafe { self.bucket_head(lock.bucket_num()) };
                let Some(removed) = chain_remove_first(head, |v| ptr::eq(v, target)) else {
                    panic!(
                        "HashTable::unlocked_eject_item: stored value not found in bucket {}",
                        lock.bucket_num()
                    );
                };

                self.update_max_deleted_rev_seqno(removed.rev_seqno());
                if removed.is_resident() {
                    self.engine_stats.incr_value_ejects();
                }
                self.value_stats.epilogue(pre, None);
            }
        }

        self.num_ejects.fetch_add(1, Ordering::Relaxed);
        true
    }

    // ------------------------------------------------------------------
    // Restore (backfill from storage)
    // ------------------------------------------------------------------

    /// Restore a fetched value into a non-resident entry. Fails (returns
    /// false) if the table is inactive or the entry is already resident.
    pub fn unlocked_restore_value(
        &self,
        lock: &HashBucketLock<'_>,
        item: &Item,
        sv: &mut StoredValue,
    ) -> bool {
        self.debug_assert_lock_matches(lock, sv);

        if !self.is_active() || sv.is_resident() {
            return false;
        }

        let pre = self.value_stats.prologue(Some(sv));
        if sv.is_temp_item() {
            // Undo the new-item marker set when the background fetch was
            // scheduled (full eviction mode).
            sv.set_new_cache_item(false);
        }
        sv.restore_value(item);
        self.value_stats.epilogue(pre, Some(sv));

        true
    }

    /// Restore fetched metadata into an entry without touching value
    /// residency.
    pub fn unlocked_restore_meta(
        &self,
        lock: &HashBucketLock<'_>,
        item: &Item,
        sv: &mut StoredValue,
    ) {
        assert!(
            self.is_active(),
            "HashTable::unlocked_restore_meta: cannot call on a non-active object"
        );
        self.debug_assert_lock_matches(lock, sv);

        let pre = self.value_stats.prologue(Some(sv));
        sv.restore_meta(item);
        self.value_stats.epilogue(pre, Some(sv));
    }

    /// Adopt an externally deflated buffer as the entry's value, with the
    /// stats bracket applied.
    pub fn store_compressed_buffer(
        &self,
        lock: &HashBucketLock<'_>,
        deflated: &[u8],
        sv: &mut StoredValue,
    ) {
        self.debug_assert_lock_matches(lock, sv);

        let pre = self.value_stats.prologue(Some(sv));
        sv.store_compressed_buffer(deflated);
        self.value_stats.epilogue(pre, Some(sv));
    }

    // ------------------------------------------------------------------
    // Random sampling
    // ------------------------------------------------------------------

    /// Pick an item starting from a caller-seeded random bucket, scanning
    /// forward (with wrap-around) for the first bucket whose chain holds
    /// an eligible entry (non-temp, non-deleted, resident, committed).
    ///
    /// No uniformity guarantee across skewed chains.
    pub fn get_random_key(&self, rnd: u64) -> Option<Item> {
        let size = self.size();
        let start = (rnd % size as u64) as usize;
        let mut curr = start;

        loop {
            if let Some(item) = self.random_key_from_slot(curr) {
                return Some(item);
            }
            curr += 1;
            if curr >= size {
                curr = 0;
            }
            if curr == start {
                return None;
            }
        }
    }

    fn random_key_from_slot(&self, slot: usize) -> Option<Item> {
        let _guard = self.mutexes[slot % self.mutexes.len()].lock();
        if slot >= self.size() {
            // Table shrank since the scan started.
            return None;
        }

        // SAFETY: the stripe lock for `slot` is held.
        let head: &Option<Box<StoredValue>> = unsafe { self.bucket_head(slot) };
        let mut cur = head.as_deref();
        while let Some(sv) = cur {
            if !sv.is_temp_item() && !sv.is_deleted() && sv.is_resident() && sv.is_committed() {
                return Some(sv.to_item());
            }
            cur = sv.next();
        }
        None
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    /// Resize to the prime-table size best matching the current item
    /// count. Invoked periodically by the resizer task.
    pub fn resize(&self) {
        let new_size = choose_size(
            self.value_stats.num_items(),
            self.initial_size,
            self.size(),
        );
        self.resize_to(new_size);
    }

    /// Resize the bucket vector to `new_size`, rehashing every chain.
    ///
    /// Silently refuses sizes beyond `i32::MAX` (hashing is modulo a
    /// signed int historically) and no-ops on the current size. Aborts,
    /// also silently, if any visitor is mid-scan; the resizer task will
    /// retry later.
    pub fn resize_to(&self, new_size: usize) {
        assert!(
            self.is_active(),
            "HashTable::resize: cannot call on a non-active object"
        );

        if new_size > i32::MAX as usize || new_size == 0 {
            return;
        }
        if new_size == self.size() {
            return;
        }

        let guards = self.lock_all();

        if self.visitors.load(Ordering::SeqCst) > 0 {
            // A visitor is processing; its position would be invalidated.
            // New visitors cannot start meaningful work while we own every
            // lock. The next resize attempt picks this up.
            debug!("resize to {new_size} deferred: visitors in flight");
            return;
        }

        let old_size = self.size();
        debug!("resizing hash table from {old_size} to {new_size}");

        let mut new_values: Vec<Option<Box<StoredValue>>> =
            (0..new_size).map(|_| None).collect();

        self.engine_stats
            .add_mem_overhead(-(self.memory_overhead() as isize));
        self.num_resizes.fetch_add(1, Ordering::Relaxed);
        self.size.store(new_size, Ordering::Release);

        // SAFETY: every stripe lock is held.
        let values = unsafe { &mut *self.values.get() };
        for slot in 0..old_size {
            while let Some(mut sv) = values[slot].take() {
                values[slot] = sv.take_next();

                let new_bucket = sv.key().hash() as usize % new_size;
                sv.set_next(new_values[new_bucket].take());
                new_values[new_bucket] = Some(sv);
            }
        }
        *values = new_values;

        self.engine_stats
            .add_mem_overhead(self.memory_overhead() as isize);
        drop(guards);
    }

    // ------------------------------------------------------------------
    // Clear
    // ------------------------------------------------------------------

    /// Drop every entry. With `deactivate`, the table additionally stops
    /// accepting operations.
    pub fn clear(&self, deactivate: bool) {
        if !deactivate {
            assert!(
                self.is_active(),
                "HashTable::clear: cannot call on a non-active object"
            );
        }
        let guards = self.lock_all();
        // SAFETY: every stripe lock is held.
        unsafe { self.clear_unlocked(deactivate) };
        drop(guards);
    }

    /// # Safety
    ///
    /// Caller must hold every stripe lock, or otherwise have exclusive
    /// access (drop).
    unsafe fn clear_unlocked(&self, deactivate: bool) {
        if deactivate {
            self.active.store(false, Ordering::Release);
        }

        let mut cleared_mem_size = 0usize;
        let mut cleared_val_size = 0usize;

        // SAFETY: per this function's contract.
        let values = unsafe { &mut *self.values.get() };
        for slot in values.iter_mut() {
            // Drain head-first; chains can be long and the recursive Box
            // drop would otherwise walk the whole chain on the stack.
            while let Some(mut sv) = slot.take() {
                cleared_mem_size += sv.size();
                cleared_val_size += sv.value_len();
                *slot = sv.take_next();
            }
        }

        self.engine_stats
            .add_current_size(-((cleared_mem_size - cleared_val_size) as isize));
        self.value_stats.reset();
    }

    // ------------------------------------------------------------------
    // Visitation
    // ------------------------------------------------------------------

    /// Run a content visitor over the whole table, resuming through
    /// pauses until the end position is reached.
    pub fn visit<V>(&self, visitor: &mut V)
    where
        V: HashTableVisitor + ?Sized,
    {
        let mut pos = Position::begin();
        while pos != self.end_position() {
            pos = self.pause_resume_visit(visitor, pos);
        }
    }

    /// The position denoting a completed visit.
    pub fn end_position(&self) -> Position {
        let size = self.size();
        Position {
            ht_size: size,
            lock: self.mutexes.len(),
            hash_bucket: size,
        }
    }

    /// Visit stored values from `start_pos`, stopping early if the
    /// visitor pauses. Returns the next position to resume from.
    ///
    /// The outer loop walks stripe locks, the inner loop the buckets each
    /// stripe owns (`bucket = lock + k * L`), re-acquiring the stripe
    /// mutex per bucket so writers see many short lock holds rather than
    /// one long one. Registering in the visitor count (under any one
    /// stripe lock) keeps resize out while a scan is in progress, which
    /// is what makes the recorded position safe to resume.
    ///
    /// A pause requested mid-chain takes effect after the chain finishes
    /// (a position within a chain is not representable); resumption then
    /// starts at the next bucket, so no entry is skipped or repeated.
    pub fn pause_resume_visit<V>(&self, visitor: &mut V, start_pos: Position) -> Position
    where
        V: HashTableVisitor + ?Sized,
    {
        if self.value_stats.num_items() + self.value_stats.num_temp_items() == 0
            || !self.is_active()
        {
            // Nothing to visit.
            return self.end_position();
        }

        let _tracker = self.register_visitor();
        // Stable while the tracker holds the visitor count above zero.
        let size = self.size();
        let num_locks = self.mutexes.len();

        let mut paused = false;
        let mut lock_idx = if start_pos.lock < num_locks {
            start_pos.lock
        } else {
            0
        };
        let mut hash_bucket = 0;

        while self.is_active() && !paused && lock_idx < num_locks {
            // Resume from the recorded bucket only if it still belongs to
            // this lock's stripe under the same table size.
            hash_bucket = lock_idx;
            if start_pos.lock == lock_idx
                && start_pos.ht_size == size
                && start_pos.hash_bucket < size
            {
                hash_bucket = start_pos.hash_bucket;
            }

            while !paused && hash_bucket < size {
                visitor.set_up_hash_bucket_visit();
                {
                    let lock = self.lock_bucket_idx(hash_bucket);
                    // SAFETY: `lock` guards this bucket's chain.
                    let head = unsafe { self.bucket_head(hash_bucket) };
                    let mut cur: *mut StoredValue = head
                        .as_deref_mut()
                        .map_or(ptr::null_mut(), |sv| sv as *mut StoredValue);
                    // A pause takes effect once the chain is finished: a
                    // Position cannot encode a spot within a chain, and
                    // stopping short would skip the tail for good.
                    while !cur.is_null() {
                        // SAFETY: chain nodes are stable under the lock.
                        let sv = unsafe { &mut *cur };
                        // Read the successor first; the visitor may mutate
                        // the value it is handed.
                        let next: *mut StoredValue = sv
                            .next_mut()
                            .as_deref_mut()
                            .map_or(ptr::null_mut(), |n| n as *mut StoredValue);
                        if visitor.visit(&lock, sv) == VisitOutcome::Pause {
                            paused = true;
                        }
                        cur = next;
                    }
                }
                visitor.tear_down_hash_bucket_visit();

                // On pause this still advances: resumption starts at the
                // *next* bucket.
                hash_bucket += num_locks;
            }

            if paused && hash_bucket < size {
                // Remaining buckets under this lock are unvisited; keep
                // the position here.
                break;
            }

            // Finished all buckets owned by this lock; `size` is the
            // consistent "end of lock" marker.
            hash_bucket = size;
            lock_idx += 1;
        }

        Position {
            ht_size: size,
            lock: lock_idx,
            hash_bucket,
        }
    }

    /// Walk every chain, reporting per-bucket depth and byte totals to a
    /// depth visitor.
    pub fn visit_depth<V>(&self, visitor: &mut V)
    where
        V: HashTableDepthVisitor + ?Sized,
    {
        if self.value_stats.num_items() == 0 || !self.is_active() {
            return;
        }

        let _tracker = self.register_visitor();
        let size = self.size();
        let num_locks = self.mutexes.len();

        for lock_idx in 0..num_locks {
            let mut bucket = lock_idx;
            while bucket < size {
                let lock = self.lock_bucket_idx(bucket);
                // SAFETY: `lock` guards this bucket's chain.
                let head: &Option<Box<StoredValue>> = unsafe { self.bucket_head(bucket) };

                if let Some(first) = head.as_deref() {
                    let expected = first.key().hash() as usize % size;
                    assert_eq!(
                        expected, bucket,
                        "HashTable::visit_depth: stored value hashes to bucket {expected} \
                         but is linked in bucket {bucket}"
                    );
                }

                let mut depth = 0usize;
                let mut mem = 0usize;
                let mut cur = head.as_deref();
                while let Some(sv) = cur {
                    depth += 1;
                    mem += sv.size();
                    cur = sv.next();
                }
                visitor.visit(bucket, depth, mem);
                drop(lock);

                bucket += num_locks;
            }
        }
    }

    // ------------------------------------------------------------------
    // Frequency counter
    // ------------------------------------------------------------------

    fn update_freq_counter(&self, sv: &mut StoredValue) {
        // The probabilistic counter either returns the same value or an
        // increment of it.
        let updated = self.probabilistic_counter.generate_value(sv.freq_counter());
        sv.set_freq_counter(updated);

        if updated == u8::MAX
            && let Some(callback) = &self.freq_saturated_cb
        {
            callback();
        }
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        // Exclusive access: no locks needed. Drains iteratively so long
        // chains cannot overflow the stack via recursive Box drops, and
        // keeps the engine-wide aggregates consistent.
        unsafe { self.clear_unlocked(true) };
        self.engine_stats
            .add_mem_overhead(-(self.memory_overhead() as isize));
    }
}

impl fmt::Debug for HashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("size", &self.size())
            .field("num_locks", &self.mutexes.len())
            .field("active", &self.is_active())
            .field("num_items", &self.value_stats.num_items())
            .field("num_temp_items", &self.value_stats.num_temp_items())
            .field("num_deleted_items", &self.value_stats.num_deleted_items())
            .field(
                "num_non_resident_items",
                &self.value_stats.num_non_resident_items(),
            )
            .field(
                "num_prepared_sync_writes",
                &self.value_stats.num_prepared_sync_writes(),
            )
            .field("num_ejects", &self.num_ejects())
            .field("num_resizes", &self.num_resizes())
            .finish()
    }
}

/// Pick the prime-table size closest to `num_items`.
///
/// Sticks with `current_size` when it already brackets the item count
/// (hysteresis against flapping between neighbours), and never goes below
/// `initial_size`.
fn choose_size(num_items: usize, initial_size: usize, current_size: usize) -> usize {
    let mut i = 0;
    while i < PRIME_SIZES.len() && PRIME_SIZES[i] < num_items {
        i += 1;
    }

    if i == PRIME_SIZES.len() {
        // Ran off the end; take the biggest.
        PRIME_SIZES[PRIME_SIZES.len() - 1]
    } else if PRIME_SIZES[i] < initial_size {
        // Would shrink below the configured floor.
        initial_size
    } else if i == 0 {
        PRIME_SIZES[0]
    } else if current_size == PRIME_SIZES[i - 1] || current_size == PRIME_SIZES[i] {
        // One of the candidates is the current size; stay put.
        current_size
    } else {
        // Somewhere in the middle; use the closer one.
        nearest(num_items, PRIME_SIZES[i - 1], PRIME_SIZES[i])
    }
}

fn distance(a: usize, b: usize) -> usize {
    a.max(b) - a.min(b)
}

fn nearest(n: usize, a: usize, b: usize) -> usize {
    if distance(n, a) < distance(b, n) { a } else { b }
}
