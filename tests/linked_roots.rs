mod common;

use std::sync::atomic::Ordering::Relaxed;

use common::MockHeap;
use heaproot::{LinkedEngine, Value};

fn engine(heap: &MockHeap) -> LinkedEngine<MockHeap> {
    let engine = LinkedEngine::new(heap.clone(), common::test_logger());
    assert!(engine.setup());
    engine
}

#[test]
fn single_root() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let root = engine.create(Value::of_int(42)).unwrap();
    assert_eq!(engine.get(&root), Value::of_int(42));
    assert_eq!(engine.live_roots(), 1);
    engine.delete(root);
    assert_eq!(engine.live_roots(), 0);
    engine.teardown();
}

#[test]
fn create_before_setup_returns_null() {
    let heap = MockHeap::new();
    let engine = LinkedEngine::new(heap.clone(), common::test_logger());
    assert!(engine.create(Value::of_int(1)).is_none());
    assert!(engine.setup());
    assert!(!engine.setup());
    assert!(engine.create(Value::of_int(1)).is_some());
}

#[test]
fn minor_scan_visits_the_young_ring_then_ages_it() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let contents: Vec<usize> = (0..50).collect();
    let young_roots: Vec<_> = contents
        .iter()
        .map(|&c| engine.create(heap.alloc_young(c)).unwrap())
        .collect();
    // Roots tracking mature or immediate payloads go straight to the
    // old ring and stay out of minor scans.
    let old_roots: Vec<_> = (0..30)
        .map(|c| engine.create(heap.alloc_mature(100 + c)).unwrap())
        .collect();

    let report =
        heap.minor_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(report.action_calls, 50);
    for (root, &content) in young_roots.iter().zip(contents.iter()) {
        let v = engine.get(root);
        assert!(heap.is_mature(v));
        assert_eq!(heap.read_block(v), content);
    }

    // The young ring was spliced onto the old one.
    let report =
        heap.minor_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(report.action_calls, 0);

    let report =
        heap.major_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(report.action_calls, 80);
    for (i, root) in old_roots.iter().enumerate() {
        assert_eq!(heap.read_block(engine.get(root)), 100 + i);
    }
    for root in young_roots.into_iter().chain(old_roots) {
        engine.delete(root);
    }
}

#[test]
fn modify_re_rings_on_old_to_young() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let mut root = engine.create(heap.alloc_mature(1)).unwrap();
    // Not on the young ring: invisible to minor scans.
    let report =
        heap.minor_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(report.action_calls, 0);

    engine.modify(&mut root, heap.alloc_young(2));
    // Now it must be, or the payload would die with the nursery.
    let report =
        heap.minor_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(report.action_calls, 1);
    assert_eq!(heap.read_block(engine.get(&root)), 2);
    engine.delete(root);
}

#[test]
fn modify_in_place_otherwise() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let mut root = engine.create(heap.alloc_young(3)).unwrap();
    let cell = engine.get_ref(&root);
    // Young roots take any payload in place.
    engine.modify(&mut root, Value::of_int(12));
    engine.modify(&mut root, heap.alloc_mature(4));
    assert_eq!(engine.get_ref(&root), cell);
    assert_eq!(heap.read_block(engine.get(&root)), 4);
    engine.delete(root);
}

#[test]
fn released_elements_are_cached_until_a_major() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let roots: Vec<_> = (0..20)
        .map(|i| engine.create(Value::of_int(i)).unwrap())
        .collect();
    for root in roots {
        engine.delete(root);
    }
    assert_eq!(engine.live_roots(), 0);
    // New roots reuse cached elements; a major scan drains the cache.
    let root = engine.create(Value::of_int(7)).unwrap();
    heap.major_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(engine.get(&root), Value::of_int(7));
    engine.delete(root);
    heap.major_collection(|action, only_young| engine.scanning_callback(action, only_young));
    engine.teardown();
}

#[test]
fn scan_work_is_counted_per_collection_kind() {
    let heap = MockHeap::new();
    let engine = engine(&heap);
    let roots: Vec<_> = (0..10)
        .map(|c| engine.create(heap.alloc_young(c)).unwrap())
        .collect();
    heap.minor_collection(|action, only_young| engine.scanning_callback(action, only_young));
    heap.major_collection(|action, only_young| engine.scanning_callback(action, only_young));
    assert_eq!(engine.stats().minor_collections.load(Relaxed), 1);
    assert_eq!(engine.stats().major_collections.load(Relaxed), 1);
    assert_eq!(engine.stats().total_scanning_work_minor.load(Relaxed), 10);
    assert_eq!(engine.stats().total_scanning_work_major.load(Relaxed), 10);
    for root in roots {
        engine.delete(root);
    }
}
