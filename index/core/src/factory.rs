//! Stored value allocation with a chosen layout.

use crate::item::Item;
use crate::stored_value::StoredValue;

/// Allocates and copies stored values.
///
/// The layout (ordered vs. unordered) is chosen when the hash table is
/// constructed and is opaque to it afterwards. Ordered values
/// additionally record their deletion time so tombstones can be purged
/// by age.
pub trait StoredValueFactory: Send + Sync {
    /// Build a new stored value from an item, linking `next` as its chain
    /// successor.
    fn create(&self, item: &Item, next: Option<Box<StoredValue>>) -> Box<StoredValue>;

    /// Copy an existing stored value, linking `next` as the copy's chain
    /// successor.
    fn copy(&self, sv: &StoredValue, next: Option<Box<StoredValue>>) -> Box<StoredValue>;
}

/// Factory for plain (unordered) stored values.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnorderedStoredValueFactory;

impl StoredValueFactory for UnorderedStoredValueFactory {
    fn create(&self, item: &Item, next: Option<Box<StoredValue>>) -> Box<StoredValue> {
        StoredValue::new(item, next, false)
    }

    fn copy(&self, sv: &StoredValue, next: Option<Box<StoredValue>>) -> Box<StoredValue> {
        StoredValue::new_from(sv, next)
    }
}

/// Factory for ordered stored values (tombstones carry a delete time).
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderedStoredValueFactory;

impl StoredValueFactory for OrderedStoredValueFactory {
    fn create(&self, item: &Item, next: Option<Box<StoredValue>>) -> Box<StoredValue> {
        StoredValue::new(item, next, true)
    }

    fn copy(&self, sv: &StoredValue, next: Option<Box<StoredValue>>) -> Box<StoredValue> {
        StoredValue::new_from(sv, next)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::item::DeleteSource;
    use crate::key::DocKey;

    fn item(k: &str, v: &str) -> Item {
        Item::new(DocKey::from_bytes(k.as_bytes().to_vec()), v.as_bytes().to_vec())
    }

    #[test]
    fn test_unordered_factory() {
        let factory = UnorderedStoredValueFactory;
        let sv = factory.create(&item("a", "v"), None);
        assert!(!sv.is_ordered());
    }

    #[test]
    fn test_ordered_factory_records_delete_time() {
        let factory = OrderedStoredValueFactory;
        let mut sv = factory.create(&item("a", "v"), None);
        assert!(sv.is_ordered());

        sv.del(DeleteSource::Explicit);
        // Deleted ordered entries carry a deletion timestamp.
        let _ = sv.deleted_time();
    }

    #[test]
    fn test_copy_links_next() {
        let factory = UnorderedStoredValueFactory;
        let next = factory.create(&item("b", "2"), None);
        let sv = factory.create(&item("a", "1"), None);
        let copy = factory.copy(&sv, Some(next));
        assert_eq!(&*copy, &*sv);
        assert!(copy.next().is_some());
    }
}
