//! End-to-end B-tree scenarios: heavy split/merge churn, concurrent
//! single-key contention, and range operations over the public API.

use std::sync::Arc;

use homestore::btree::{
    Btree, BtreeError, KeyRange, MemNodeStore, PutRequest, PutType, QueryRequest,
    RangeRemoveRequest,
};
use homestore::config::BtreeConfig;

type U64Tree = Btree<u64, u64, MemNodeStore>;

fn small_tree() -> U64Tree {
    // 512-byte nodes force frequent splits: 448-byte data area, 16-byte
    // cells, at most 27 entries per leaf.
    let cfg = BtreeConfig::with_node_size(512);
    Btree::new(MemNodeStore::new(512), cfg).unwrap()
}

#[test]
fn thousand_upserts_split_and_stay_sorted() {
    let tree = small_tree();

    for k in 1..=1000u64 {
        tree.put(&mut PutRequest::new(k, k + 100_000, PutType::Upsert))
            .unwrap();
    }
    assert!(tree.node_count() > 30, "node_count={}", tree.node_count());

    for k in 1..=1000u64 {
        assert_eq!(tree.get(&k).unwrap(), k + 100_000, "key {}", k);
    }

    let mut out = Vec::new();
    let mut req = QueryRequest::sweep(KeyRange::inclusive(1u64, 1000u64), u32::MAX);
    let more = tree.query(&mut req, &mut out).unwrap();
    assert!(!more);
    assert_eq!(out.len(), 1000);
    assert!(out.windows(2).all(|w| w[0].0 < w[1].0), "unsorted output");
    for (i, (k, v)) in out.iter().enumerate() {
        assert_eq!(*k, i as u64 + 1);
        assert_eq!(*v, *k + 100_000);
    }
}

#[test]
fn eight_threads_churn_one_key() {
    use std::sync::Barrier;

    let tree = Arc::new(small_tree());
    let threads = 8usize;
    let ops_per_thread = 1250usize; // 10,000 operations total
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..ops_per_thread {
                    let stamp = (t * ops_per_thread + i) as u64;
                    if (t + i) % 2 == 0 {
                        // No retry status may surface from the engine.
                        tree.upsert(42, stamp).unwrap();
                    } else {
                        match tree.remove(&42) {
                            Ok(_) | Err(BtreeError::NotFound) => {}
                            Err(e) => panic!("retry leaked to caller: {}", e),
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // The key is either absent or holds one of the stamped values.
    match tree.get(&42) {
        Ok(v) => assert!(v < (threads * ops_per_thread) as u64),
        Err(BtreeError::NotFound) => {}
        Err(e) => panic!("unexpected status: {}", e),
    }
}

#[test]
fn deleting_every_even_key_merges_nodes() {
    let tree = small_tree();

    for k in 1..=10_000u64 {
        tree.upsert(k, k).unwrap();
    }
    let peak = tree.node_count();

    for k in (2..=10_000u64).step_by(2) {
        tree.remove(&k).unwrap();
    }

    let all = tree
        .get_all_kvs(KeyRange::inclusive(0u64, u64::MAX))
        .unwrap();
    assert_eq!(all.len(), 5_000);
    assert!(all.iter().all(|(k, _)| k % 2 == 1));

    let after = tree.node_count();
    let reduction = (peak - after) as f64 / peak as f64;
    assert!(
        reduction >= 0.30,
        "merge reclaimed too little: peak={} after={} reduction={:.2}",
        peak,
        after,
        reduction
    );
}

#[test]
fn range_remove_leaves_flanks_intact() {
    let tree = small_tree();
    for k in 0..300u64 {
        tree.upsert(k, k * 7).unwrap();
    }

    let removed = tree
        .range_remove(&mut RangeRemoveRequest::new(KeyRange::inclusive(
            100u64, 200u64,
        )))
        .unwrap();
    assert_eq!(removed, 101);

    for k in 100..=200u64 {
        assert_eq!(tree.get(&k).unwrap_err(), BtreeError::NotFound, "key {}", k);
    }
    for k in (0..100u64).chain(201..300) {
        assert_eq!(tree.get(&k).unwrap(), k * 7, "key {}", k);
    }
}

#[test]
fn query_cursor_survives_interleaved_writes() {
    let tree = small_tree();
    for k in (0..1000u64).step_by(2) {
        tree.upsert(k, k).unwrap();
    }

    let mut req = QueryRequest::sweep(KeyRange::inclusive(0u64, 999u64), 100);
    let mut seen = Vec::new();
    loop {
        let mut out = Vec::new();
        let more = tree.query(&mut req, &mut out).unwrap();
        seen.extend(out.iter().map(|(k, _)| *k));
        // Writes between batches must not disturb keys already returned.
        tree.upsert(1_000_001, 1).unwrap();
        if !more {
            break;
        }
    }

    assert_eq!(seen.len(), 500);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn destroy_is_idempotent() {
    let tree = small_tree();
    for k in 0..500u64 {
        tree.upsert(k, k).unwrap();
    }
    let nodes = tree.node_count();

    assert_eq!(tree.destroy().unwrap(), nodes);
    assert_eq!(tree.destroy().unwrap(), 0);
}
