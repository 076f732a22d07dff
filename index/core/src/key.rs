//! Document keys with collection scoping and a stable cached hash.

use ahash::RandomState;
use std::fmt;
use std::sync::LazyLock;

/// Process-wide hasher state. Every [`DocKey`] caches its hash at
/// construction, so all keys must be hashed with the same state for the
/// bucket invariant (`hash % size == bucket`) to hold across the table.
static HASH_STATE: LazyLock<RandomState> = LazyLock::new(|| {
    // Use fixed seeds in tests for deterministic behavior
    #[cfg(test)]
    let state = RandomState::with_seeds(
        0xbb8c484891ec6c86,
        0x0522a25ae9c769f9,
        0xeed2797b9571bc75,
        0x4feb29c1fbbd59d0,
    );
    #[cfg(not(test))]
    let state = RandomState::new();

    state
});

/// Identifier of the collection a key belongs to.
///
/// Collection `0` is the default collection; the system namespace holds
/// internal entries (collection manifests and similar) that are counted
/// separately by the hash table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionId(pub u32);

impl CollectionId {
    /// The default collection.
    pub const DEFAULT: CollectionId = CollectionId(0);

    /// The reserved system-event namespace.
    pub const SYSTEM: CollectionId = CollectionId(1);

    /// Whether this id addresses the reserved system namespace.
    #[inline]
    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// An opaque document key scoped to a collection.
///
/// Equality is byte-equality of key plus collection. The 32-bit hash is
/// computed once at construction and covers both the collection id and
/// the key bytes.
#[derive(Clone)]
pub struct DocKey {
    key: Box<[u8]>,
    collection: CollectionId,
    hash: u32,
}

impl DocKey {
    /// Create a key in the given collection.
    pub fn new(key: impl Into<Box<[u8]>>, collection: CollectionId) -> Self {
        let key = key.into();
        let hash = HASH_STATE.hash_one((collection, &*key)) as u32;
        Self {
            key,
            collection,
            hash,
        }
    }

    /// Create a key in the default collection.
    pub fn from_bytes(key: impl Into<Box<[u8]>>) -> Self {
        Self::new(key, CollectionId::DEFAULT)
    }

    /// The raw key bytes (without the collection prefix).
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.key
    }

    /// Length of the raw key bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// Whether the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// The collection this key belongs to.
    #[inline]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// The cached 32-bit hash of (collection, key bytes).
    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl PartialEq for DocKey {
    fn eq(&self, other: &Self) -> bool {
        self.collection == other.collection && self.key == other.key
    }
}

impl Eq for DocKey {}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DocKey(cid={}, key={:?})",
            self.collection.0,
            String::from_utf8_lossy(&self.key)
        )
    }
}

impl From<&str> for DocKey {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes().to_vec())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_equality_includes_collection() {
        let a = DocKey::new(b"key".to_vec(), CollectionId::DEFAULT);
        let b = DocKey::new(b"key".to_vec(), CollectionId::DEFAULT);
        let c = DocKey::new(b"key".to_vec(), CollectionId(7));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_stable_across_instances() {
        let a = DocKey::from_bytes(b"stable".to_vec());
        let b = DocKey::from_bytes(b"stable".to_vec());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_covers_collection() {
        let a = DocKey::new(b"key".to_vec(), CollectionId::DEFAULT);
        let b = DocKey::new(b"key".to_vec(), CollectionId::SYSTEM);
        // Not guaranteed in general, but with fixed test seeds these two
        // must differ for collection scoping to be meaningful.
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_system_collection() {
        assert!(CollectionId::SYSTEM.is_system());
        assert!(!CollectionId::DEFAULT.is_system());
        assert!(!CollectionId(42).is_system());
    }
}
