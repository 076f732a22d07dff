//! The stored value record and its intrusive bucket chain.
//!
//! A [`StoredValue`] is one logical key-version entry resident in the hash
//! table. Each hash bucket owns the head of a singly-linked chain of
//! stored values; every value exclusively owns its successor, so dropping
//! a head transitively drops the chain.

use crate::compression;
use crate::item::{CommittedState, Datatype, DeleteSource, Item};
use crate::key::DocKey;
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Policy for reclaiming memory from a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop only the value bytes, keeping key and metadata resident.
    Value,
    /// Remove the entire entry from the table.
    Full,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Bits: u8 {
        const DIRTY = 0b0000_0001;
        const DELETED = 0b0000_0010;
        const RESIDENT = 0b0000_0100;
        const ORDERED = 0b0000_1000;
        const NEW_CACHE_ITEM = 0b0001_0000;
    }
}

/// Wall-clock seconds, truncated to the 32-bit expiry domain.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

/// One key-version entry in a hash bucket chain.
pub struct StoredValue {
    value: Option<Bytes>,
    next: Option<Box<StoredValue>>,
    key: DocKey,
    cas: u64,
    by_seqno: i64,
    rev_seqno: u64,
    /// Lock expiry for alive entries; delete time for deleted ordered
    /// entries (the two states are mutually exclusive).
    lock_expiry_or_delete_time: u32,
    exptime: u32,
    flags: u32,
    datatype: Datatype,
    committed: CommittedState,
    delete_source: DeleteSource,
    freq_counter: u8,
    bits: Bits,
}

impl StoredValue {
    /// `by_seqno` sentinel: assigned seqno pending (e.g. just deleted).
    pub const STATE_PENDING_SEQNO: i64 = -2;
    /// `by_seqno` sentinel: temp entry for a key known deleted on disk.
    pub const STATE_DELETED_KEY: i64 = -3;
    /// `by_seqno` sentinel: temp entry for a key known absent on disk.
    pub const STATE_NON_EXISTENT_KEY: i64 = -4;
    /// `by_seqno` sentinel: temp entry created to reserve a slot while a
    /// background fetch is in flight.
    pub const STATE_TEMP_INIT: i64 = -5;

    /// CAS value reported for locked entries when hiding the real CAS.
    pub const LOCKED_CAS: u64 = u64::MAX;

    pub(crate) fn new(item: &Item, next: Option<Box<StoredValue>>, ordered: bool) -> Box<Self> {
        let mut bits = Bits::NEW_CACHE_ITEM;
        if ordered {
            bits |= Bits::ORDERED;
        }
        if item.is_deleted() {
            bits |= Bits::DELETED;
        }

        let mut sv = Box::new(Self {
            value: item.value_cloned(),
            next,
            key: item.key().clone(),
            cas: item.cas(),
            by_seqno: item.by_seqno(),
            rev_seqno: item.rev_seqno(),
            lock_expiry_or_delete_time: 0,
            exptime: item.exptime(),
            flags: item.flags(),
            datatype: item.datatype(),
            committed: item.committed(),
            delete_source: item.delete_source(),
            freq_counter: item.freq_counter(),
            bits,
        });

        sv.set_resident(!sv.is_temp_item());
        if sv.is_temp_initial_item() {
            sv.mark_clean();
        } else {
            sv.mark_dirty();
        }
        if sv.is_temp_item() {
            sv.value = None;
        }

        sv
    }

    pub(crate) fn new_from(other: &StoredValue, next: Option<Box<StoredValue>>) -> Box<Self> {
        Box::new(Self {
            value: other.value.clone(),
            next,
            key: other.key.clone(),
            cas: other.cas,
            by_seqno: other.by_seqno,
            rev_seqno: other.rev_seqno,
            lock_expiry_or_delete_time: other.lock_expiry_or_delete_time,
            exptime: other.exptime,
            flags: other.flags,
            datatype: other.datatype,
            committed: other.committed,
            delete_source: other.delete_source,
            freq_counter: other.freq_counter,
            bits: other.bits,
        })
    }

    // ------------------------------------------------------------------
    // Chain
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn next(&self) -> Option<&StoredValue> {
        self.next.as_deref()
    }

    #[inline]
    pub(crate) fn next_mut(&mut self) -> &mut Option<Box<StoredValue>> {
        &mut self.next
    }

    #[inline]
    pub(crate) fn take_next(&mut self) -> Option<Box<StoredValue>> {
        self.next.take()
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: Option<Box<StoredValue>>) {
        self.next = next;
    }

    // ------------------------------------------------------------------
    // Identity & sizing
    // ------------------------------------------------------------------

    /// The document key.
    #[inline]
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Whether this entry stores the given key.
    #[inline]
    pub fn has_key(&self, key: &DocKey) -> bool {
        self.key == *key
    }

    /// Total in-memory footprint: record, key bytes, and value bytes.
    #[inline]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value_len()
    }

    /// Footprint excluding value bytes.
    #[inline]
    pub fn metadata_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }

    /// Length of the (possibly compressed) value, 0 if non-resident.
    #[inline]
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Length the value would have uncompressed.
    pub fn uncompressed_value_len(&self) -> usize {
        match &self.value {
            None => 0,
            Some(v) if self.datatype.contains(Datatype::SNAPPY) => {
                compression::uncompressed_length(v).unwrap_or_else(|| v.len())
            }
            Some(v) => v.len(),
        }
    }

    /// Total footprint with the value counted uncompressed.
    #[inline]
    pub fn uncompressed_size(&self) -> usize {
        self.metadata_size() + self.uncompressed_value_len()
    }

    // ------------------------------------------------------------------
    // Metadata accessors
    // ------------------------------------------------------------------

    /// The value bytes, if resident.
    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// CAS version token.
    #[inline]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Set the CAS version token.
    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Per-vbucket sequence number (may be a temp sentinel).
    #[inline]
    pub fn by_seqno(&self) -> i64 {
        self.by_seqno
    }

    /// Set the per-vbucket sequence number.
    pub fn set_by_seqno(&mut self, seqno: i64) {
        self.by_seqno = seqno;
    }

    /// Revision sequence number.
    #[inline]
    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    /// Set the revision sequence number.
    pub fn set_rev_seqno(&mut self, seqno: u64) {
        self.rev_seqno = seqno;
    }

    /// Client-visible flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Set the client-visible flags.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// Expiry time (0 = never).
    #[inline]
    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    /// Set the expiry time.
    pub fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    /// Payload encoding.
    #[inline]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Set the payload encoding.
    pub fn set_datatype(&mut self, datatype: Datatype) {
        self.datatype = datatype;
    }

    /// Commit state of this entry.
    #[inline]
    pub fn committed(&self) -> CommittedState {
        self.committed
    }

    /// Set the commit state.
    pub fn set_committed(&mut self, state: CommittedState) {
        self.committed = state;
    }

    /// Whether this entry is in a committed state.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed.is_committed()
    }

    /// Whether this entry is a prepare (pending sync write).
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.committed.is_pending()
    }

    /// Whether this entry is a prepare that blocks reads of the key.
    #[inline]
    pub fn is_prepared_maybe_visible(&self) -> bool {
        self.committed == CommittedState::PreparedMaybeVisible
    }

    /// Access-frequency estimate.
    #[inline]
    pub fn freq_counter(&self) -> u8 {
        self.freq_counter
    }

    /// Set the access-frequency estimate.
    pub fn set_freq_counter(&mut self, freq: u8) {
        self.freq_counter = freq;
    }

    /// Why the entry was deleted; meaningful only when deleted.
    #[inline]
    pub fn delete_source(&self) -> DeleteSource {
        self.delete_source
    }

    // ------------------------------------------------------------------
    // State bits
    // ------------------------------------------------------------------

    /// Whether the entry holds its value bytes in memory.
    #[inline]
    pub fn is_resident(&self) -> bool {
        self.bits.contains(Bits::RESIDENT)
    }

    fn set_resident(&mut self, resident: bool) {
        self.bits.set(Bits::RESIDENT, resident);
    }

    /// Whether the entry is a tombstone.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.bits.contains(Bits::DELETED)
    }

    /// Whether the entry has a mutation not yet persisted.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.bits.contains(Bits::DIRTY)
    }

    /// Mark the entry as having an unpersisted mutation.
    pub fn mark_dirty(&mut self) {
        self.bits.insert(Bits::DIRTY);
    }

    /// Mark the entry as persisted.
    pub fn mark_clean(&mut self) {
        self.bits.remove(Bits::DIRTY);
    }

    /// Whether the entry uses the ordered layout.
    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.bits.contains(Bits::ORDERED)
    }

    /// Whether this entry was newly added to the cache (as opposed to
    /// loaded back from persistence).
    #[inline]
    pub fn is_new_cache_item(&self) -> bool {
        self.bits.contains(Bits::NEW_CACHE_ITEM)
    }

    /// Set the new-cache-item marker.
    pub fn set_new_cache_item(&mut self, new_item: bool) {
        self.bits.set(Bits::NEW_CACHE_ITEM, new_item);
    }

    // ------------------------------------------------------------------
    // Temp item states
    // ------------------------------------------------------------------

    /// Placeholder created while a background fetch is outstanding.
    #[inline]
    pub fn is_temp_initial_item(&self) -> bool {
        self.by_seqno == Self::STATE_TEMP_INIT
    }

    /// Temp entry recording that the key is deleted on disk.
    #[inline]
    pub fn is_temp_deleted_item(&self) -> bool {
        self.by_seqno == Self::STATE_DELETED_KEY
    }

    /// Temp entry recording that the key does not exist on disk.
    #[inline]
    pub fn is_temp_non_existent_item(&self) -> bool {
        self.by_seqno == Self::STATE_NON_EXISTENT_KEY
    }

    /// Any of the temp placeholder states.
    #[inline]
    pub fn is_temp_item(&self) -> bool {
        self.is_temp_initial_item()
            || self.is_temp_deleted_item()
            || self.is_temp_non_existent_item()
    }

    /// Convert this entry into a temp-deleted placeholder.
    pub fn set_temp_deleted(&mut self) {
        self.by_seqno = Self::STATE_DELETED_KEY;
    }

    /// Convert this entry into a temp-non-existent placeholder.
    pub fn set_temp_non_existent(&mut self) {
        self.by_seqno = Self::STATE_NON_EXISTENT_KEY;
    }

    // ------------------------------------------------------------------
    // Locking & expiry
    // ------------------------------------------------------------------

    /// Lock the entry until the given time.
    pub fn lock(&mut self, until: u32) {
        if !self.is_deleted() {
            self.lock_expiry_or_delete_time = until;
        }
    }

    /// Clear any lock on the entry.
    pub fn unlock(&mut self) {
        if !self.is_deleted() {
            self.lock_expiry_or_delete_time = 0;
        }
    }

    /// Whether the entry is locked at the given time.
    #[inline]
    pub fn is_locked(&self, now: u32) -> bool {
        !self.is_deleted()
            && self.lock_expiry_or_delete_time != 0
            && now < self.lock_expiry_or_delete_time
    }

    /// Whether the entry's TTL has passed at the given time.
    #[inline]
    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime < now
    }

    /// Time the entry was deleted. Only recorded for ordered entries;
    /// panics if the entry is alive.
    pub fn deleted_time(&self) -> u32 {
        assert!(
            self.is_ordered() && self.is_deleted(),
            "StoredValue::deleted_time: called on alive or unordered entry"
        );
        self.lock_expiry_or_delete_time
    }

    fn set_deleted_time(&mut self, time: u32) {
        assert!(
            self.is_deleted(),
            "StoredValue::set_deleted_time: called on alive entry"
        );
        self.lock_expiry_or_delete_time = time;
    }

    // ------------------------------------------------------------------
    // Value transitions
    // ------------------------------------------------------------------

    /// Replace this entry's contents with the item's.
    ///
    /// A deleted entry becoming alive again counts as a new cache item.
    /// Temp items stay non-resident; everything else adopts the item's
    /// value and becomes resident.
    pub fn set_value(&mut self, item: &Item) {
        if self.is_deleted() && !item.is_deleted() {
            self.set_new_cache_item(true);
        }

        self.bits.set(Bits::DELETED, item.is_deleted());
        if item.is_deleted() {
            self.delete_source = item.delete_source();
        }

        self.flags = item.flags();
        self.datatype = item.datatype();
        self.by_seqno = item.by_seqno();
        self.cas = item.cas();
        self.lock_expiry_or_delete_time = 0;
        self.exptime = item.exptime();
        self.rev_seqno = item.rev_seqno();

        if self.is_temp_initial_item() {
            self.mark_clean();
        } else {
            self.mark_dirty();
        }

        if self.is_temp_item() {
            self.set_resident(false);
        } else {
            self.set_resident(true);
            self.value = item.value_cloned();
        }
        self.committed = item.committed();

        if self.is_ordered() && self.is_deleted() {
            self.set_deleted_time(now_secs());
        }
    }

    /// Delete the entry: drop the value, reset the datatype, and mark the
    /// tombstone dirty. Returns false if already deleted with no value
    /// left to drop.
    pub fn del(&mut self, source: DeleteSource) -> bool {
        if self.is_deleted() && self.value.is_none() {
            return false;
        }

        self.value = None;
        self.datatype = Datatype::RAW;
        self.by_seqno = Self::STATE_PENDING_SEQNO;
        self.bits.insert(Bits::DELETED);
        self.delete_source = source;
        self.mark_dirty();

        if self.is_ordered() {
            self.set_deleted_time(now_secs());
        }

        true
    }

    /// Mark the entry deleted but keep the value buffer (tombstone with
    /// body).
    pub fn mark_deleted(&mut self, source: DeleteSource) {
        self.bits.insert(Bits::DELETED);
        self.delete_source = source;
        self.mark_dirty();

        if self.is_ordered() {
            self.set_deleted_time(now_secs());
        }
    }

    /// Drop the value bytes, keeping key and metadata.
    pub fn eject_value(&mut self) {
        self.mark_not_resident();
    }

    /// Drop the value bytes and clear residency.
    pub fn mark_not_resident(&mut self) {
        self.value = None;
        self.set_resident(false);
    }

    /// Whether this entry may be evicted under the given policy.
    ///
    /// Dirty entries must first be persisted, temp entries are awaiting a
    /// fetch, and prepares must survive until they resolve. Value
    /// eviction additionally needs a resident, non-deleted value to drop.
    pub fn eligible_for_eviction(&self, policy: EvictionPolicy) -> bool {
        let common = !self.is_dirty() && !self.is_temp_item() && self.is_committed();
        match policy {
            EvictionPolicy::Value => common && self.is_resident() && !self.is_deleted(),
            EvictionPolicy::Full => common,
        }
    }

    /// Restore a fetched value into a non-resident or temp entry.
    pub fn restore_value(&mut self, item: &Item) {
        if self.is_temp_initial_item() || self.is_temp_deleted_item() {
            self.cas = item.cas();
            self.flags = item.flags();
            self.exptime = item.exptime();
            self.rev_seqno = item.rev_seqno();
            self.by_seqno = item.by_seqno();
        }
        self.datatype = item.datatype();
        self.bits.set(Bits::DELETED, item.is_deleted());
        if item.is_deleted() {
            self.delete_source = item.delete_source();
        }

        self.value = item.value_cloned();
        self.freq_counter = item.freq_counter();
        self.committed = item.committed();
        self.set_resident(true);
    }

    /// Restore metadata from a fetched item without touching residency.
    pub fn restore_meta(&mut self, item: &Item) {
        self.cas = item.cas();
        self.flags = item.flags();
        self.datatype = item.datatype();
        self.exptime = item.exptime();
        self.rev_seqno = item.rev_seqno();
        if item.is_deleted() {
            self.set_temp_deleted();
        } else {
            // Regular item under full eviction; the temp marker was set
            // when the fetch was scheduled.
            self.by_seqno = item.by_seqno();
            self.set_new_cache_item(false);
        }
        self.freq_counter = item.freq_counter();
        self.committed = item.committed();
    }

    // ------------------------------------------------------------------
    // Compression
    // ------------------------------------------------------------------

    /// Compress the value in place with snappy.
    ///
    /// Keeps the original buffer if deflation would grow it. Returns
    /// false only if compression itself failed.
    pub fn compress_value(&mut self) -> bool {
        if self.datatype.contains(Datatype::SNAPPY) {
            return true;
        }
        let Some(value) = &self.value else {
            return true;
        };

        match compression::deflate(value) {
            Some(deflated) => {
                if deflated.len() > value.len() {
                    // No point keeping it compressed if it grew.
                    return true;
                }
                self.value = Some(deflated);
                self.datatype |= Datatype::SNAPPY;
                true
            }
            None => false,
        }
    }

    /// Adopt an externally deflated buffer as the value.
    pub fn store_compressed_buffer(&mut self, deflated: &[u8]) {
        self.value = Some(Bytes::copy_from_slice(deflated));
        self.datatype |= Datatype::SNAPPY;
    }

    // ------------------------------------------------------------------
    // Conversion
    // ------------------------------------------------------------------

    /// Build an [`Item`] snapshot of this entry.
    pub fn to_item(&self) -> Item {
        let mut item = Item::new_meta(self.key.clone());
        if let Some(value) = &self.value {
            item.set_value(value.clone());
        }
        item.set_flags(self.flags);
        item.set_exptime(self.exptime);
        item.set_datatype(self.datatype);
        item.set_cas(self.cas);
        item.set_by_seqno(self.by_seqno);
        item.set_rev_seqno(self.rev_seqno);
        item.set_committed(self.committed);
        item.set_freq_counter(self.freq_counter);
        if self.is_deleted() {
            item.set_deleted(self.delete_source);
        }
        item
    }
}

impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        self.cas == other.cas
            && self.rev_seqno == other.rev_seqno
            && self.by_seqno == other.by_seqno
            && self.lock_expiry_or_delete_time == other.lock_expiry_or_delete_time
            && self.exptime == other.exptime
            && self.flags == other.flags
            && self.is_dirty() == other.is_dirty()
            && self.is_deleted() == other.is_deleted()
            // Deletion source only matters for tombstones.
            && (!self.is_deleted() || self.delete_source == other.delete_source)
            && self.is_new_cache_item() == other.is_new_cache_item()
            && self.is_ordered() == other.is_ordered()
            && self.is_resident() == other.is_resident()
            && self.key == other.key
            && self.committed == other.committed
    }
}

impl Eq for StoredValue {}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.committed {
            CommittedState::CommittedViaMutation => "Cm",
            CommittedState::CommittedViaPrepare => "Cp",
            CommittedState::Pending => "Pe",
            CommittedState::PreparedMaybeVisible => "Pv",
        };
        write!(
            f,
            "SV {}{}{}{} {} seq:{} rev:{} cas:{} key:{:?} vallen:{}",
            if self.is_dirty() { 'W' } else { '.' },
            if self.is_deleted() { 'D' } else { '.' },
            if self.is_new_cache_item() { 'N' } else { '.' },
            if self.is_resident() { 'R' } else { '.' },
            state,
            self.by_seqno,
            self.rev_seqno,
            self.cas,
            self.key,
            self.value_len(),
        )
    }
}

/// Remove the first chain entry matching `pred`, splicing its successor
/// into its place. Returns the removed entry (with `next` cleared), or
/// `None` if nothing matched.
pub(crate) fn chain_remove_first<F>(
    head: &mut Option<Box<StoredValue>>,
    mut pred: F,
) -> Option<Box<StoredValue>>
where
    F: FnMut(&StoredValue) -> bool,
{
    let mut cur = head;
    loop {
        match cur {
            None => return None,
            Some(sv) if pred(sv) => {}
            Some(sv) => {
                cur = &mut sv.next;
                continue;
            }
        }
        let mut removed = cur.take()?;
        *cur = removed.next.take();
        return Some(removed);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::key::CollectionId;

    fn key(s: &str) -> DocKey {
        DocKey::new(s.as_bytes().to_vec(), CollectionId::DEFAULT)
    }

    fn committed_item(k: &str, v: &str) -> Item {
        Item::new(key(k), v.as_bytes().to_vec())
    }

    fn make_sv(k: &str, v: &str) -> Box<StoredValue> {
        StoredValue::new(&committed_item(k, v), None, false)
    }

    #[test]
    fn test_new_committed_value() {
        let sv = make_sv("a", "value");
        assert!(sv.is_resident());
        assert!(sv.is_dirty());
        assert!(sv.is_new_cache_item());
        assert!(!sv.is_deleted());
        assert!(sv.is_committed());
        assert_eq!(sv.value_len(), 5);
    }

    #[test]
    fn test_temp_initial_item_is_clean_and_non_resident() {
        let mut item = Item::new_meta(key("a"));
        item.set_by_seqno(StoredValue::STATE_TEMP_INIT);
        let sv = StoredValue::new(&item, None, false);

        assert!(sv.is_temp_item());
        assert!(sv.is_temp_initial_item());
        assert!(!sv.is_resident());
        assert!(!sv.is_dirty());
        assert_eq!(sv.value_len(), 0);
    }

    #[test]
    fn test_del_drops_value_and_marks_tombstone() {
        let mut sv = make_sv("a", "value");
        assert!(sv.del(DeleteSource::Ttl));

        assert!(sv.is_deleted());
        assert!(sv.is_dirty());
        assert_eq!(sv.delete_source(), DeleteSource::Ttl);
        assert_eq!(sv.value_len(), 0);
        assert_eq!(sv.datatype(), Datatype::RAW);
        assert_eq!(sv.by_seqno(), StoredValue::STATE_PENDING_SEQNO);

        // Second delete of a valueless tombstone is a no-op.
        assert!(!sv.del(DeleteSource::Explicit));
    }

    #[test]
    fn test_mark_deleted_keeps_value() {
        let mut sv = make_sv("a", "value");
        sv.mark_deleted(DeleteSource::Explicit);
        assert!(sv.is_deleted());
        assert_eq!(sv.value_len(), 5);
    }

    #[test]
    fn test_set_value_deleted_to_alive_is_new_cache_item() {
        let mut sv = make_sv("a", "v1");
        sv.del(DeleteSource::Explicit);
        sv.set_new_cache_item(false);

        sv.set_value(&committed_item("a", "v2"));
        assert!(!sv.is_deleted());
        assert!(sv.is_new_cache_item());
        assert_eq!(sv.value().unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_eject_and_restore_value() {
        let mut sv = make_sv("a", "value");
        sv.mark_clean();
        sv.eject_value();
        assert!(!sv.is_resident());
        assert_eq!(sv.value_len(), 0);

        let mut item = committed_item("a", "value");
        item.set_freq_counter(9);
        sv.restore_value(&item);
        assert!(sv.is_resident());
        assert_eq!(sv.value_len(), 5);
        assert_eq!(sv.freq_counter(), 9);
    }

    #[test]
    fn test_restore_meta_deleted_becomes_temp_deleted() {
        let mut item = Item::new_meta(key("a"));
        item.set_by_seqno(StoredValue::STATE_TEMP_INIT);
        let mut sv = StoredValue::new(&item, None, false);

        let mut fetched = committed_item("a", "ignored");
        fetched.set_deleted(DeleteSource::Explicit);
        fetched.set_cas(77);
        sv.restore_meta(&fetched);

        assert!(sv.is_temp_deleted_item());
        assert_eq!(sv.cas(), 77);
        assert!(!sv.is_resident());
    }

    #[test]
    fn test_restore_meta_alive_adopts_seqno() {
        let mut item = Item::new_meta(key("a"));
        item.set_by_seqno(StoredValue::STATE_TEMP_INIT);
        let mut sv = StoredValue::new(&item, None, false);

        let mut fetched = committed_item("a", "ignored");
        fetched.set_by_seqno(1234);
        sv.restore_meta(&fetched);

        assert_eq!(sv.by_seqno(), 1234);
        assert!(!sv.is_new_cache_item());
        assert!(!sv.is_temp_item());
    }

    #[test]
    fn test_eviction_eligibility() {
        let mut sv = make_sv("a", "value");
        // Dirty entries are not evictable under either policy.
        assert!(!sv.eligible_for_eviction(EvictionPolicy::Value));
        assert!(!sv.eligible_for_eviction(EvictionPolicy::Full));

        sv.mark_clean();
        assert!(sv.eligible_for_eviction(EvictionPolicy::Value));
        assert!(sv.eligible_for_eviction(EvictionPolicy::Full));

        // Once non-resident there is no value left to eject.
        sv.eject_value();
        assert!(!sv.eligible_for_eviction(EvictionPolicy::Value));
        assert!(sv.eligible_for_eviction(EvictionPolicy::Full));
    }

    #[test]
    fn test_prepare_not_evictable() {
        let mut item = committed_item("a", "value");
        item.set_pending_sync_write();
        let mut sv = StoredValue::new(&item, None, false);
        sv.mark_clean();
        assert!(!sv.eligible_for_eviction(EvictionPolicy::Value));
        assert!(!sv.eligible_for_eviction(EvictionPolicy::Full));
    }

    #[test]
    fn test_lock_expiry() {
        let mut sv = make_sv("a", "value");
        sv.lock(100);
        assert!(sv.is_locked(50));
        assert!(!sv.is_locked(100));
        sv.unlock();
        assert!(!sv.is_locked(50));
    }

    #[test]
    fn test_expiry() {
        let mut sv = make_sv("a", "value");
        assert!(!sv.is_expired(u32::MAX), "exptime 0 never expires");
        sv.set_exptime(10);
        assert!(!sv.is_expired(10));
        assert!(sv.is_expired(11));
    }

    #[test]
    fn test_compress_value_sets_snappy_bit() {
        let mut sv = make_sv("a", &"abcabcabc".repeat(50));
        let original_len = sv.value_len();
        assert!(sv.compress_value());
        assert!(sv.datatype().contains(Datatype::SNAPPY));
        assert!(sv.value_len() < original_len);
        assert_eq!(sv.uncompressed_value_len(), original_len);
    }

    #[test]
    fn test_compress_value_idempotent() {
        let mut sv = make_sv("a", &"xyzxyz".repeat(40));
        assert!(sv.compress_value());
        let compressed_len = sv.value_len();
        assert!(sv.compress_value());
        assert_eq!(sv.value_len(), compressed_len);
    }

    #[test]
    fn test_to_item_roundtrip() {
        let mut item = committed_item("a", "value");
        item.set_cas(42);
        item.set_rev_seqno(7);
        item.set_by_seqno(3);
        item.set_flags(0xdead);
        let sv = StoredValue::new(&item, None, false);

        let out = sv.to_item();
        assert_eq!(out.key(), item.key());
        assert_eq!(out.cas(), 42);
        assert_eq!(out.rev_seqno(), 7);
        assert_eq!(out.by_seqno(), 3);
        assert_eq!(out.flags(), 0xdead);
        assert_eq!(out.value().unwrap().as_ref(), b"value");
        assert!(!out.is_deleted());
    }

    #[test]
    fn test_chain_remove_first() {
        let c = StoredValue::new(&committed_item("c", "3"), None, false);
        let b = StoredValue::new(&committed_item("b", "2"), Some(c), false);
        let a = StoredValue::new(&committed_item("a", "1"), Some(b), false);
        let mut head = Some(a);

        let removed = chain_remove_first(&mut head, |sv| sv.has_key(&key("b"))).unwrap();
        assert!(removed.has_key(&key("b")));
        assert!(removed.next().is_none());

        // a -> c remains.
        let first = head.as_deref().unwrap();
        assert!(first.has_key(&key("a")));
        assert!(first.next().unwrap().has_key(&key("c")));
        assert!(first.next().unwrap().next().is_none());

        assert!(chain_remove_first(&mut head, |sv| sv.has_key(&key("missing"))).is_none());
    }

    #[test]
    fn test_chain_remove_head() {
        let b = StoredValue::new(&committed_item("b", "2"), None, false);
        let a = StoredValue::new(&committed_item("a", "1"), Some(b), false);
        let mut head = Some(a);

        let removed = chain_remove_first(&mut head, |sv| sv.has_key(&key("a"))).unwrap();
        assert!(removed.has_key(&key("a")));
        assert!(head.as_deref().unwrap().has_key(&key("b")));
    }

    #[test]
    fn test_copy_preserves_state() {
        let mut sv = make_sv("a", "value");
        sv.mark_clean();
        sv.set_cas(99);
        sv.set_freq_counter(12);

        let copy = StoredValue::new_from(&sv, None);
        assert_eq!(&*copy, &*sv);
        assert_eq!(copy.freq_counter(), 12);
    }
}
