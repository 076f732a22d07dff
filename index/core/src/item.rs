//! The item record exchanged between the hash table and its callers.

use crate::key::DocKey;
use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Payload encoding bitset.
    ///
    /// Raw bytes are the empty set; the bits compose (e.g. snappy-compressed
    /// JSON with xattrs is `JSON | SNAPPY | XATTR`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Datatype: u8 {
        /// Value is JSON.
        const JSON = 0b001;
        /// Value is snappy-compressed.
        const SNAPPY = 0b010;
        /// Value carries extended attributes.
        const XATTR = 0b100;
    }
}

impl Datatype {
    /// Raw, uncompressed bytes with no attributes.
    pub const RAW: Datatype = Datatype::empty();

    /// Number of distinct datatype combinations, for per-datatype counters.
    pub const COUNT: usize = 8;

    /// Index into a per-datatype counter array.
    #[inline]
    pub fn index(&self) -> usize {
        self.bits() as usize
    }
}

/// Commit state of a document version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommittedState {
    /// A regular committed mutation.
    CommittedViaMutation,
    /// A sync write that has been committed.
    CommittedViaPrepare,
    /// A prepared (not yet committed) sync write.
    Pending,
    /// A prepare that may already be visible on another node; reads of the
    /// key must block until the prepare resolves.
    PreparedMaybeVisible,
}

impl CommittedState {
    /// Whether this state is one of the committed variants.
    #[inline]
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            Self::CommittedViaMutation | Self::CommittedViaPrepare
        )
    }

    /// Whether this state is one of the pending (prepare) variants.
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::PreparedMaybeVisible)
    }
}

/// Why a document was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteSource {
    /// Deleted by an explicit client request.
    #[default]
    Explicit,
    /// Deleted by TTL expiry.
    Ttl,
}

/// Input/output record for hash table operations.
///
/// An `Item` is the external form of a document version: front-end
/// operations hand one in, warmup and backfill load them from persistence,
/// and [`StoredValue::to_item`](crate::StoredValue::to_item) produces one
/// on the way out. The value is reference-counted so converting between
/// `Item` and stored form does not copy payload bytes.
#[derive(Debug, Clone)]
pub struct Item {
    key: DocKey,
    value: Option<Bytes>,
    flags: u32,
    exptime: u32,
    datatype: Datatype,
    cas: u64,
    by_seqno: i64,
    rev_seqno: u64,
    committed: CommittedState,
    deleted: bool,
    delete_source: DeleteSource,
    freq_counter: u8,
}

impl Item {
    /// Create a committed item carrying a value.
    pub fn new(key: DocKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: Some(value.into()),
            flags: 0,
            exptime: 0,
            datatype: Datatype::RAW,
            cas: 0,
            by_seqno: 0,
            rev_seqno: 1,
            committed: CommittedState::CommittedViaMutation,
            deleted: false,
            delete_source: DeleteSource::Explicit,
            freq_counter: 0,
        }
    }

    /// Create a metadata-only item (no value).
    pub fn new_meta(key: DocKey) -> Self {
        Self {
            value: None,
            ..Self::new(key, Bytes::new())
        }
    }

    /// The document key.
    #[inline]
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// The value payload, if any.
    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Take a cheap reference-counted clone of the value.
    #[inline]
    pub fn value_cloned(&self) -> Option<Bytes> {
        self.value.clone()
    }

    /// Replace the value payload.
    pub fn set_value(&mut self, value: impl Into<Bytes>) {
        self.value = Some(value.into());
    }

    /// Drop the value payload.
    pub fn clear_value(&mut self) {
        self.value = None;
    }

    /// Client-visible document flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Set the client-visible document flags.
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

    /// The CAS version token.
    #[inline]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Set the CAS version token.
    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Per-vbucket sequence number.
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

    /// Commit state of this version.
    #[inline]
    pub fn committed(&self) -> CommittedState {
        self.committed
    }

    /// Whether this item is in a committed state.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed.is_committed()
    }

    /// Whether this item is a prepare.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.committed.is_pending()
    }

    /// Mark this item as a prepared sync write.
    pub fn set_pending_sync_write(&mut self) {
        self.committed = CommittedState::Pending;
    }

    /// Mark this prepare as possibly visible elsewhere; reads must block.
    pub fn set_prepared_maybe_visible(&mut self) {
        self.committed = CommittedState::PreparedMaybeVisible;
    }

    /// Mark this item as committed via a prepare.
    pub fn set_committed_via_prepare(&mut self) {
        self.committed = CommittedState::CommittedViaPrepare;
    }

    /// Set the commit state directly.
    pub fn set_committed(&mut self, state: CommittedState) {
        self.committed = state;
    }

    /// Whether this item is a tombstone.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Why the item was deleted. Only meaningful when [`is_deleted`] is
    /// true.
    ///
    /// [`is_deleted`]: Item::is_deleted
    #[inline]
    pub fn delete_source(&self) -> DeleteSource {
        self.delete_source
    }

    /// Mark this item deleted.
    pub fn set_deleted(&mut self, source: DeleteSource) {
        self.deleted = true;
        self.delete_source = source;
    }

    /// Access-frequency estimate carried across load/store.
    #[inline]
    pub fn freq_counter(&self) -> u8 {
        self.freq_counter
    }

    /// Set the access-frequency estimate.
    pub fn set_freq_counter(&mut self, freq: u8) {
        self.freq_counter = freq;
    }

    /// Length of the value payload in bytes (0 when absent).
    #[inline]
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }
}
