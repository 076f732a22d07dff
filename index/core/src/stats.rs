//! Hash table statistics with transactional prologue/epilogue updates.
//!
//! A stored value has many classifications (resident, deleted, temp,
//! system, prepared, datatype, ...) and a single in-place mutation can
//! cross several at once. Rather than sprinkling counter updates through
//! every mutation path, each mutation is bracketed: snapshot the value's
//! properties before ([`Statistics::prologue`]), mutate, snapshot again
//! and apply the signed delta of every tracked category
//! ([`Statistics::epilogue`]).
//!
//! Counters are relaxed atomics and are deliberately not protected by the
//! stripe locks: snapshot reads may briefly disagree with a full chain
//! walk. Do not promote them to locked fields.

use crate::item::Datatype;
use crate::stored_value::StoredValue;
use crate::sync::{AtomicUsize, Ordering, fetch_add_signed};
use std::sync::Arc;

/// Engine-wide counters shared by every hash table in the bucket.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total metadata bytes currently held in memory.
    current_size: AtomicUsize,
    /// Bytes of index overhead (bucket vectors, lock arrays).
    mem_overhead: AtomicUsize,
    /// Ejections refused because the value was ineligible.
    num_failed_ejects: AtomicUsize,
    /// Values ejected from memory.
    num_value_ejects: AtomicUsize,
}

impl EngineStats {
    /// Total metadata bytes currently held in memory.
    pub fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Bytes of index overhead.
    pub fn mem_overhead(&self) -> usize {
        self.mem_overhead.load(Ordering::Relaxed)
    }

    /// Ejections refused because the value was ineligible.
    pub fn num_failed_ejects(&self) -> usize {
        self.num_failed_ejects.load(Ordering::Relaxed)
    }

    /// Values ejected from memory.
    pub fn num_value_ejects(&self) -> usize {
        self.num_value_ejects.load(Ordering::Relaxed)
    }

    pub(crate) fn add_current_size(&self, delta: isize) {
        fetch_add_signed(&self.current_size, delta);
    }

    pub(crate) fn add_mem_overhead(&self, delta: isize) {
        fetch_add_signed(&self.mem_overhead, delta);
    }

    pub(crate) fn incr_failed_ejects(&self) {
        self.num_failed_ejects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_value_ejects(&self) {
        self.num_value_ejects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the stat-relevant properties of one stored value.
///
/// A default-constructed snapshot (from `None`) denotes "no such value":
/// insertion uses an empty prologue, removal an empty epilogue.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StoredValueProperties {
    is_valid: bool,
    size: usize,
    metadata_size: usize,
    uncompressed_size: usize,
    datatype: Datatype,
    is_resident: bool,
    is_deleted: bool,
    is_temp: bool,
    is_system: bool,
    is_prepared: bool,
}

impl StoredValueProperties {
    fn new(sv: Option<&StoredValue>) -> Self {
        let Some(sv) = sv else {
            return Self::default();
        };
        Self {
            is_valid: true,
            size: sv.size(),
            metadata_size: sv.metadata_size(),
            uncompressed_size: sv.uncompressed_size(),
            datatype: sv.datatype(),
            is_resident: sv.is_resident(),
            is_deleted: sv.is_deleted(),
            is_temp: sv.is_temp_item(),
            is_system: sv.key().collection().is_system(),
            is_prepared: sv.is_pending(),
        }
    }

    /// Valid, in-memory but value-less, alive, non-temp.
    fn is_non_resident(&self) -> bool {
        self.is_valid && !self.is_resident && !self.is_deleted && !self.is_temp
    }

    /// Valid and counted in `num_items`.
    fn is_counted_item(&self) -> bool {
        self.is_valid && !self.is_temp
    }

    /// Counted in the per-datatype histogram: non-temp, non-deleted,
    /// committed.
    fn counts_datatype(&self) -> bool {
        self.is_counted_item() && !self.is_deleted && !self.is_prepared
    }

    /// Counted as deleted: tombstones that are neither system events nor
    /// unresolved prepares.
    fn is_counted_deleted(&self) -> bool {
        self.is_deleted && !self.is_system && !self.is_prepared
    }

    fn is_counted_prepare(&self) -> bool {
        self.is_valid && self.is_prepared
    }

    fn is_counted_system(&self) -> bool {
        self.is_valid && self.is_system
    }
}

/// Per-hash-table counters maintained by the prologue/epilogue protocol.
#[derive(Debug)]
pub struct Statistics {
    engine: Arc<EngineStats>,
    datatype_counts: [AtomicUsize; Datatype::COUNT],
    num_items: AtomicUsize,
    num_temp_items: AtomicUsize,
    num_non_resident_items: AtomicUsize,
    num_deleted_items: AtomicUsize,
    num_system_items: AtomicUsize,
    num_prepared_sync_writes: AtomicUsize,
    mem_size: AtomicUsize,
    cache_size: AtomicUsize,
    uncompressed_mem_size: AtomicUsize,
    metadata_memory: AtomicUsize,
}

impl Statistics {
    pub(crate) fn new(engine: Arc<EngineStats>) -> Self {
        Self {
            engine,
            datatype_counts: Default::default(),
            num_items: AtomicUsize::new(0),
            num_temp_items: AtomicUsize::new(0),
            num_non_resident_items: AtomicUsize::new(0),
            num_deleted_items: AtomicUsize::new(0),
            num_system_items: AtomicUsize::new(0),
            num_prepared_sync_writes: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            cache_size: AtomicUsize::new(0),
            uncompressed_mem_size: AtomicUsize::new(0),
            metadata_memory: AtomicUsize::new(0),
        }
    }

    /// Snapshot a value's properties before mutating it.
    pub(crate) fn prologue(&self, sv: Option<&StoredValue>) -> StoredValueProperties {
        StoredValueProperties::new(sv)
    }

    /// Compare the post-mutation properties with the prologue snapshot and
    /// apply the delta of every category that changed.
    pub(crate) fn epilogue(&self, pre: StoredValueProperties, sv: Option<&StoredValue>) {
        let post = StoredValueProperties::new(sv);

        if pre.size != post.size {
            let delta = post.size as isize - pre.size as isize;
            fetch_add_signed(&self.cache_size, delta);
            fetch_add_signed(&self.mem_size, delta);
        }
        if pre.metadata_size != post.metadata_size {
            let delta = post.metadata_size as isize - pre.metadata_size as isize;
            fetch_add_signed(&self.metadata_memory, delta);
            self.engine.add_current_size(delta);
        }
        if pre.uncompressed_size != post.uncompressed_size {
            fetch_add_signed(
                &self.uncompressed_mem_size,
                post.uncompressed_size as isize - pre.uncompressed_size as isize,
            );
        }

        if pre.is_non_resident() != post.is_non_resident() {
            fetch_add_signed(
                &self.num_non_resident_items,
                post.is_non_resident() as isize - pre.is_non_resident() as isize,
            );
        }

        if pre.is_temp != post.is_temp {
            fetch_add_signed(
                &self.num_temp_items,
                post.is_temp as isize - pre.is_temp as isize,
            );
        }

        if pre.is_counted_item() != post.is_counted_item() {
            fetch_add_signed(
                &self.num_items,
                post.is_counted_item() as isize - pre.is_counted_item() as isize,
            );
        }

        if pre.is_counted_system() != post.is_counted_system() {
            fetch_add_signed(
                &self.num_system_items,
                post.is_counted_system() as isize - pre.is_counted_system() as isize,
            );
        }

        if pre.is_counted_prepare() != post.is_counted_prepare() {
            fetch_add_signed(
                &self.num_prepared_sync_writes,
                post.is_counted_prepare() as isize - pre.is_counted_prepare() as isize,
            );
        }

        if pre.is_counted_deleted() != post.is_counted_deleted() {
            fetch_add_signed(
                &self.num_deleted_items,
                post.is_counted_deleted() as isize - pre.is_counted_deleted() as isize,
            );
        }

        if pre.counts_datatype() {
            self.datatype_counts[pre.datatype.index()].fetch_sub(1, Ordering::Relaxed);
        }
        if post.counts_datatype() {
            self.datatype_counts[post.datatype.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Zero the counters invalidated by a table clear.
    pub(crate) fn reset(&self) {
        for count in &self.datatype_counts {
            count.store(0, Ordering::Relaxed);
        }
        self.num_items.store(0, Ordering::Relaxed);
        self.num_temp_items.store(0, Ordering::Relaxed);
        self.num_non_resident_items.store(0, Ordering::Relaxed);
        self.mem_size.store(0, Ordering::Relaxed);
        self.cache_size.store(0, Ordering::Relaxed);
        self.uncompressed_mem_size.store(0, Ordering::Relaxed);
    }

    /// The shared engine-wide counters.
    pub fn engine(&self) -> &Arc<EngineStats> {
        &self.engine
    }

    /// Count of valid, non-temp entries.
    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    /// Count of temp placeholder entries.
    pub fn num_temp_items(&self) -> usize {
        self.num_temp_items.load(Ordering::Relaxed)
    }

    /// Count of alive, non-temp entries without their value in memory.
    pub fn num_non_resident_items(&self) -> usize {
        self.num_non_resident_items.load(Ordering::Relaxed)
    }

    /// Count of tombstones (excluding system events and prepares).
    pub fn num_deleted_items(&self) -> usize {
        self.num_deleted_items.load(Ordering::Relaxed)
    }

    /// Count of entries in the system namespace.
    pub fn num_system_items(&self) -> usize {
        self.num_system_items.load(Ordering::Relaxed)
    }

    /// Count of unresolved prepared sync writes.
    pub fn num_prepared_sync_writes(&self) -> usize {
        self.num_prepared_sync_writes.load(Ordering::Relaxed)
    }

    /// Total bytes of stored values.
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// Bytes of stored values counted toward the cache quota.
    pub fn cache_size(&self) -> usize {
        self.cache_size.load(Ordering::Relaxed)
    }

    /// Total bytes with compressed values counted at their inflated size.
    pub fn uncompressed_mem_size(&self) -> usize {
        self.uncompressed_mem_size.load(Ordering::Relaxed)
    }

    /// Bytes of key and record metadata.
    pub fn metadata_memory(&self) -> usize {
        self.metadata_memory.load(Ordering::Relaxed)
    }

    /// Count of items with the given datatype (non-temp, non-deleted,
    /// committed entries only).
    pub fn datatype_count(&self, datatype: Datatype) -> usize {
        self.datatype_counts[datatype.index()].load(Ordering::Relaxed)
    }
}
