//! End-to-end scenarios: growth and shrink across the prime table,
//! prepare/commit coexistence, eviction round-trips, pause-resumable
//! visitation under mutation, and resize/visitor interlocking.

use index_core::{
    CommittedState, DeleteSource, DocKey, EngineStats, EvictionPolicy, HashBucketLock,
    HashTable, HashTableConfig, HashTableVisitor, Item, MutationStatus, Position, StoredValue,
    TrackReference, UnorderedStoredValueFactory, VisitOutcome, WantsDeleted,
};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn make_ht(initial_size: usize, num_locks: usize) -> HashTable {
    HashTable::new(
        Arc::new(EngineStats::default()),
        Box::new(UnorderedStoredValueFactory),
        HashTableConfig::new()
            .with_initial_size(initial_size)
            .with_num_locks(num_locks),
    )
}

fn key(s: &str) -> DocKey {
    DocKey::from_bytes(s.as_bytes().to_vec())
}

fn committed(k: &str, v: &str) -> Item {
    Item::new(key(k), v.as_bytes().to_vec())
}

fn pending(k: &str, v: &str) -> Item {
    let mut item = committed(k, v);
    item.set_pending_sync_write();
    item
}

#[test]
fn grow_then_shrink_stability() {
    let ht = make_ht(47, 16);

    // Insert 50k distinct keys, resizing periodically as the resizer task
    // would. The size must climb monotonically through the prime table.
    let mut last_size = ht.size();
    for i in 0..50_000 {
        ht.set(&committed(&format!("key{i}"), "v"));
        if i % 1000 == 999 {
            ht.resize();
            let size = ht.size();
            assert!(size >= last_size, "size shrank while growing: {last_size} -> {size}");
            last_size = size;
        }
    }
    ht.resize();
    assert_eq!(ht.size(), 49157);
    assert_eq!(ht.statistics().num_items(), 50_000);

    // Hard-delete most of the population; the table shrinks toward the
    // primes bracketing the remaining count.
    for i in 0..49_900 {
        let k = key(&format!("key{i}"));
        let lock = ht.lock_bucket(&k);
        ht.unlocked_del(&lock, &k);
    }
    assert_eq!(ht.statistics().num_items(), 100);
    ht.resize();
    assert_eq!(ht.size(), 97, "nearest prime to 100 items");
    // A further resize with the same population is stable.
    ht.resize();
    assert_eq!(ht.size(), 97);

    // Shrinking below the configured floor stops at initial_size.
    for i in 49_900..49_990 {
        let k = key(&format!("key{i}"));
        let lock = ht.lock_bucket(&k);
        ht.unlocked_del(&lock, &k);
    }
    assert_eq!(ht.statistics().num_items(), 10);
    ht.resize();
    assert_eq!(ht.size(), 47, "initial size is the shrink floor");
}

/// Walk a bucket chain, collecting (value bytes, cas, state) per entry
/// matching the key.
fn chain_entries_for(ht: &HashTable, k: &DocKey) -> Vec<(Vec<u8>, u64, CommittedState)> {
    struct ChainCollector<'k> {
        key: &'k DocKey,
        bucket: usize,
        entries: Vec<(Vec<u8>, u64, CommittedState)>,
    }
    impl HashTableVisitor for ChainCollector<'_> {
        fn visit(&mut self, lock: &HashBucketLock<'_>, sv: &mut StoredValue) -> VisitOutcome {
            if lock.bucket_num() == self.bucket && sv.has_key(self.key) {
                self.entries.push((
                    sv.value().map(|v| v.to_vec()).unwrap_or_default(),
                    sv.cas(),
                    sv.committed(),
                ));
            }
            VisitOutcome::Continue
        }
    }

    let bucket = {
        let lock = ht.lock_bucket(k);
        lock.bucket_num()
    };
    let mut collector = ChainCollector {
        key: k,
        bucket,
        entries: Vec::new(),
    };
    ht.visit(&mut collector);
    collector.entries
}

#[test]
fn prepare_commit_coexistence() {
    let ht = make_ht(5, 1);
    let k = key("a");

    let mut first = committed("a", "1");
    first.set_cas(10);
    assert_eq!(ht.set(&first), MutationStatus::WasClean);

    let mut prepare = pending("a", "2");
    prepare.set_cas(11);
    assert_eq!(ht.set(&prepare), MutationStatus::WasClean);

    // Both entries share the bucket chain.
    assert_eq!(chain_entries_for(&ht, &k).len(), 2);
    assert_eq!(ht.statistics().num_prepared_sync_writes(), 1);

    // Read sees the committed value; write targets the prepare.
    {
        let read = ht.find_for_read(&k, TrackReference::No, WantsDeleted::No);
        let sv = read.stored_value.unwrap();
        assert_eq!(sv.value().unwrap().as_ref(), b"1");
        assert_eq!(sv.cas(), 10);
    }
    {
        let write = ht.find_for_write(&k, WantsDeleted::No);
        let sv = write.stored_value.unwrap();
        assert_eq!(sv.value().unwrap().as_ref(), b"2");
        assert_eq!(sv.cas(), 11);
    }

    // Commit: replace the committed entry with the prepare's contents,
    // then drop the prepare.
    {
        let result = ht.find_for_commit(&k);
        let prepare_sv = result.pending.expect("prepare in flight");
        let mut committed_item = prepare_sv.to_item();
        committed_item.set_committed_via_prepare();

        let committed_sv = result.committed.expect("previous committed entry");
        let update = ht.unlocked_update_stored_value(&result.lock, committed_sv, &committed_item);
        assert!(update.stored_value.is_some());

        ht.unlocked_del_sv(&result.lock, prepare_sv);
    }

    let entries = chain_entries_for(&ht, &k);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, b"2");
    assert_eq!(entries[0].1, 11);
    assert_eq!(entries[0].2, CommittedState::CommittedViaPrepare);
    assert_eq!(ht.statistics().num_prepared_sync_writes(), 0);
    assert_eq!(ht.statistics().num_items(), 1);
}

#[test]
fn prepared_maybe_visible_blocks_reads() {
    let ht = make_ht(5, 1);
    let k = key("a");

    ht.set(&committed("a", "1"));

    let mut blocked = pending("a", "2");
    blocked.set_prepared_maybe_visible();
    assert_eq!(ht.set(&blocked), MutationStatus::WasClean);

    // The read returns the prepare itself as the blocked signal.
    let read = ht.find_for_read(&k, TrackReference::No, WantsDeleted::No);
    let sv = read.stored_value.expect("signal entry");
    assert_eq!(sv.committed(), CommittedState::PreparedMaybeVisible);
    assert!(sv.is_pending());
}

#[test]
fn value_eviction_round_trip() {
    let ht = make_ht(5, 1);
    let k = key("a");

    ht.set(&committed("a", "payload"));
    {
        let result = ht.find_for_write(&k, WantsDeleted::No);
        let sv = result.stored_value.unwrap();
        sv.mark_clean();
        assert!(ht.unlocked_eject_item(&result.lock, sv, EvictionPolicy::Value));
    }

    {
        let read = ht.find_for_read(&k, TrackReference::No, WantsDeleted::No);
        let sv = read.stored_value.expect("metadata stays resident in the index");
        assert!(!sv.is_resident());
    }
    assert_eq!(ht.statistics().num_non_resident_items(), 1);

    {
        let result = ht.find_for_write(&k, WantsDeleted::No);
        let sv = result.stored_value.unwrap();
        assert!(ht.unlocked_restore_value(&result.lock, &committed("a", "payload"), sv));
    }

    let read = ht.find_for_read(&k, TrackReference::No, WantsDeleted::No);
    assert!(read.stored_value.unwrap().is_resident());
    assert_eq!(ht.statistics().num_non_resident_items(), 0);
}

#[test]
fn paused_visit_sees_stable_keys_exactly_once() {
    let ht = make_ht(769, 16);

    for i in 0..1000 {
        ht.set(&committed(&format!("pre{i}"), "v"));
    }

    struct PausingVisitor {
        visits: usize,
        seen: HashMap<Vec<u8>, usize>,
    }
    impl HashTableVisitor for PausingVisitor {
        fn visit(&mut self, _lock: &HashBucketLock<'_>, sv: &mut StoredValue) -> VisitOutcome {
            self.visits += 1;
            *self.seen.entry(sv.key().bytes().to_vec()).or_insert(0) += 1;
            if self.visits % 7 == 0 {
                VisitOutcome::Pause
            } else {
                VisitOutcome::Continue
            }
        }
    }

    let mut visitor = PausingVisitor {
        visits: 0,
        seen: HashMap::new(),
    };

    // Drive the visit to completion, inserting unrelated keys at every
    // pause the way front-end traffic would interleave with a scan.
    let mut new_idx = 0;
    let mut resumes = 0;
    let mut pos = Position::begin();
    while pos != ht.end_position() {
        pos = ht.pause_resume_visit(&mut visitor, pos);
        resumes += 1;
        for _ in 0..2 {
            if new_idx < 200 {
                ht.set(&committed(&format!("new{new_idx}"), "v"));
                new_idx += 1;
            }
        }
    }
    assert!(resumes > 100, "pause every 7 visits over 1000+ keys");

    for i in 0..1000 {
        let count = visitor.seen.get(format!("pre{i}").as_bytes()).copied();
        assert_eq!(count, Some(1), "pre{i} must be visited exactly once");
    }
    // Keys inserted mid-scan may or may not be seen, but never twice.
    for i in 0..200 {
        let count = visitor
            .seen
            .get(format!("new{i}").as_bytes())
            .copied()
            .unwrap_or(0);
        assert!(count <= 1, "new{i} visited {count} times");
    }
}

#[test]
fn resize_deferred_while_visitor_active() {
    let ht = make_ht(47, 4);
    for i in 0..50 {
        ht.set(&committed(&format!("key{i}"), "v"));
    }

    struct SlowVisitor;
    impl HashTableVisitor for SlowVisitor {
        fn visit(&mut self, _lock: &HashBucketLock<'_>, _sv: &mut StoredValue) -> VisitOutcome {
            std::thread::sleep(Duration::from_millis(5));
            VisitOutcome::Continue
        }
    }

    std::thread::scope(|scope| {
        let scan = scope.spawn(|| {
            ht.visit(&mut SlowVisitor);
        });

        // Give the scan time to register, then attempt a resize mid-scan.
        std::thread::sleep(Duration::from_millis(50));
        ht.resize_to(97);
        assert_eq!(ht.size(), 47, "resize must defer to the in-flight visitor");
        assert_eq!(ht.num_resizes(), 0);

        scan.join().expect("visitor thread panicked");
    });

    // With the visitor done the next attempt goes through.
    ht.resize_to(97);
    assert_eq!(ht.size(), 97);
    assert_eq!(ht.num_resizes(), 1);
}

#[test]
fn resize_preserves_entry_multiset() {
    let ht = make_ht(5, 2);
    for i in 0..300 {
        let mut item = committed(&format!("key{i}"), &format!("value{i}"));
        item.set_cas(i as u64 + 1);
        ht.set(&item);
    }
    // A couple of prepares mixed in.
    for i in 0..10 {
        let mut item = pending(&format!("key{i}"), "prep");
        item.set_cas(1000 + i as u64);
        ht.set(&item);
    }

    struct TupleCollector {
        tuples: Vec<(Vec<u8>, u64, CommittedState)>,
    }
    impl HashTableVisitor for TupleCollector {
        fn visit(&mut self, _lock: &HashBucketLock<'_>, sv: &mut StoredValue) -> VisitOutcome {
            self.tuples
                .push((sv.key().bytes().to_vec(), sv.cas(), sv.committed()));
            VisitOutcome::Continue
        }
    }

    let collect = |ht: &HashTable| {
        let mut collector = TupleCollector { tuples: Vec::new() };
        ht.visit(&mut collector);
        collector.tuples.sort();
        collector.tuples
    };

    let before = collect(&ht);
    ht.resize_to(383);
    let after = collect(&ht);
    assert_eq!(before, after);

    ht.resize_to(47);
    let shrunk = collect(&ht);
    assert_eq!(before, shrunk);
}

#[test]
fn stats_match_full_walk_after_random_ops() {
    let ht = make_ht(47, 8);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5eed);

    for _ in 0..5000 {
        let id: u32 = rng.random_range(0..800);
        let k = key(&format!("key{id}"));
        match rng.random_range(0..10u8) {
            // Mostly writes.
            0..=5 => {
                ht.set(&committed(&format!("key{id}"), &format!("v{id}")));
            }
            6 => {
                let result = ht.find_for_write(&k, WantsDeleted::No);
                if let Some(sv) = result.stored_value {
                    ht.unlocked_soft_delete(&result.lock, sv, false, DeleteSource::Explicit);
                }
            }
            7 => {
                let result = ht.find_for_write(&k, WantsDeleted::Yes);
                if result.stored_value.is_some() {
                    ht.unlocked_del(&result.lock, &k);
                }
            }
            8 => {
                let result = ht.find_for_write(&k, WantsDeleted::No);
                if let Some(sv) = result.stored_value {
                    sv.mark_clean();
                    ht.unlocked_eject_item(&result.lock, sv, EvictionPolicy::Value);
                }
            }
            _ => {
                let _ = ht.find_for_read(&k, TrackReference::Yes, WantsDeleted::No);
            }
        }
        if rng.random_range(0..500u32) == 0 {
            ht.resize();
        }
    }

    struct Walk {
        items: usize,
        deleted: usize,
        non_resident: usize,
        mem: usize,
    }
    impl HashTableVisitor for Walk {
        fn visit(&mut self, _lock: &HashBucketLock<'_>, sv: &mut StoredValue) -> VisitOutcome {
            if !sv.is_temp_item() {
                self.items += 1;
            }
            if sv.is_deleted() && !sv.is_pending() {
                self.deleted += 1;
            }
            if !sv.is_resident() && !sv.is_deleted() && !sv.is_temp_item() {
                self.non_resident += 1;
            }
            self.mem += sv.size();
            VisitOutcome::Continue
        }
    }

    let mut walk = Walk {
        items: 0,
        deleted: 0,
        non_resident: 0,
        mem: 0,
    };
    ht.visit(&mut walk);

    let stats = ht.statistics();
    assert_eq!(walk.items, stats.num_items());
    assert_eq!(walk.deleted, stats.num_deleted_items());
    assert_eq!(walk.non_resident, stats.num_non_resident_items());
    assert_eq!(walk.mem, stats.mem_size());
}

#[test]
fn concurrent_writers_and_readers() {
    let ht = make_ht(47, 16);

    std::thread::scope(|scope| {
        for t in 0..4 {
            let ht = &ht;
            scope.spawn(move || {
                for i in 0..1000 {
                    ht.set(&committed(&format!("t{t}-key{i}"), "value"));
                }
            });
        }
        for _ in 0..2 {
            let ht = &ht;
            scope.spawn(move || {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
                for _ in 0..2000 {
                    let t = rng.random_range(0..4u8);
                    let i = rng.random_range(0..1000u32);
                    let k = key(&format!("t{t}-key{i}"));
                    let _ = ht.find_for_read(&k, TrackReference::Yes, WantsDeleted::No);
                }
            });
        }
        let ht_resize = &ht;
        scope.spawn(move || {
            for _ in 0..10 {
                ht_resize.resize();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    });

    assert_eq!(ht.statistics().num_items(), 4000);
    for t in 0..4 {
        for i in 0..1000 {
            let k = key(&format!("t{t}-key{i}"));
            let result = ht.find_for_read(&k, TrackReference::No, WantsDeleted::No);
            assert!(result.stored_value.is_some(), "t{t}-key{i} lost");
        }
    }
}

#[test]
fn set_is_idempotent_for_stats() {
    let ht = make_ht(5, 1);
    let mut item = committed("a", "value");
    item.set_cas(9);
    item.set_rev_seqno(2);

    ht.set(&item);
    let items = ht.statistics().num_items();
    let mem = ht.statistics().mem_size();
    let cache = ht.statistics().cache_size();

    ht.set(&item);
    assert_eq!(ht.statistics().num_items(), items);
    assert_eq!(ht.statistics().mem_size(), mem);
    assert_eq!(ht.statistics().cache_size(), cache);
}

#[test]
fn bucket_invariant_survives_interleaved_resizes() {
    let ht = make_ht(5, 2);
    for round in 0..5 {
        for i in 0..200 {
            ht.set(&committed(&format!("r{round}-key{i}"), "v"));
        }
        ht.resize();
        // visit_depth asserts each chain head hashes to its own bucket.
        struct Nop;
        impl index_core::HashTableDepthVisitor for Nop {
            fn visit(&mut self, _bucket: usize, _depth: usize, _mem: usize) {}
        }
        ht.visit_depth(&mut Nop);
    }
    assert_eq!(ht.statistics().num_items(), 1000);
}
