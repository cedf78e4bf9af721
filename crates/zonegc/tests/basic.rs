//! Basic allocation and collection tests for zonegc.

use std::sync::atomic::{AtomicUsize, Ordering};

use zonegc::{trace_all_slots, CellPtr, GcRuntime, KindId, KindInfo, Value};

fn runtime() -> GcRuntime {
    GcRuntime::with_defaults().unwrap()
}

/// Allocates `n` tenured cells linked through slot 0; returns the head.
fn chain(rt: &mut GcRuntime, zone: zonegc::ZoneId, n: usize) -> Vec<CellPtr> {
    let cells: Vec<CellPtr> = (0..n)
        .map(|_| rt.allocate(zone, KindId::OBJECT, 1).unwrap())
        .collect();
    for pair in cells.windows(2) {
        rt.store(pair[0], 0, Value::cell(pair[1])).unwrap();
    }
    cells
}

#[test]
fn test_basic_allocation() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let cell = rt.allocate(zone, KindId::OBJECT, 3).unwrap();

    assert!(cell.is_tenured());
    assert!(rt.is_alive(cell));
    assert_eq!(rt.slot_count(cell).unwrap(), 3);
    assert_eq!(rt.kind_of(cell).unwrap(), KindId::OBJECT);
    assert_eq!(rt.zone_of(cell).unwrap(), zone);
    for slot in 0..3 {
        assert!(rt.get_slot(cell, slot).unwrap().is_null());
    }
}

#[test]
fn test_slots_hold_integers_and_cells() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let a = rt.allocate(zone, KindId::OBJECT, 2).unwrap();
    let b = rt.allocate(zone, KindId::OBJECT, 0).unwrap();

    rt.store(a, 0, Value::int(-42)).unwrap();
    rt.store(a, 1, Value::cell(b)).unwrap();

    assert_eq!(rt.get_slot(a, 0).unwrap().as_int(), Some(-42));
    assert_eq!(rt.get_slot(a, 1).unwrap().as_cell(), Some(b));
}

#[test]
fn test_unrooted_cells_are_collected() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let garbage = rt.allocate(zone, KindId::OBJECT, 1).unwrap();

    rt.gc();

    assert!(!rt.is_alive(garbage));
    assert_eq!(rt.zone(zone).unwrap().live_cells(), 0);
}

#[test]
fn test_rooted_chain_survives() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let cells = chain(&mut rt, zone, 50);
    rt.add_root(cells[0]);

    rt.gc();

    assert!(cells.iter().all(|&c| rt.is_alive(c)));
    assert_eq!(rt.zone(zone).unwrap().live_cells(), 50);
}

#[test]
fn test_cycles_are_collected() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let cells = chain(&mut rt, zone, 10);
    rt.store(cells[9], 0, Value::cell(cells[0])).unwrap();

    let root = rt.add_root(cells[0]);
    rt.gc();
    assert!(cells.iter().all(|&c| rt.is_alive(c)));

    rt.remove_root(root);
    rt.gc();
    assert!(cells.iter().all(|&c| !rt.is_alive(c)));
}

#[test]
fn test_survivors_stay_black_until_next_collection() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let cell = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let root = rt.add_root(cell);

    rt.gc();

    assert_eq!(rt.mark_color(cell).as_str(), "black");
    let fresh = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    assert_eq!(rt.mark_color(fresh).as_str(), "white");

    // Old marks are discarded when the next cycle starts.
    rt.remove_root(root);
    rt.gc();
    assert!(!rt.is_alive(cell));
    assert!(!rt.is_alive(fresh));
}

#[test]
fn test_zone_collection_leaves_other_zones_marks() {
    let mut rt = runtime();
    let collected = rt.create_zone().unwrap();
    let other = rt.create_zone().unwrap();
    let garbage = rt.allocate(collected, KindId::OBJECT, 0).unwrap();
    let kept = rt.allocate(other, KindId::OBJECT, 0).unwrap();
    let root = rt.add_root(garbage);
    rt.add_root(kept);
    rt.gc();
    assert_eq!(rt.mark_color(garbage).as_str(), "black");

    rt.remove_root(root);
    rt.gc_zones(&[collected]).unwrap();

    assert!(!rt.is_alive(garbage));
    assert!(rt.is_alive(kept));
    assert_eq!(rt.mark_color(kept).as_str(), "black");
}

#[test]
fn test_empty_collection_is_idempotent() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();

    for _ in 0..3 {
        rt.gc();
        assert_eq!(rt.gcstate(), "NotActive");
        assert_eq!(rt.zone(zone).unwrap().arena_count(), 0);
        assert_eq!(rt.pages_in_use(), 0);
    }
}

#[test]
fn test_trace_visits_each_reachable_cell_once() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let cells = chain(&mut rt, zone, 5);
    rt.store(cells[4], 0, Value::cell(cells[0])).unwrap();
    let unreachable = rt.allocate(zone, KindId::OBJECT, 0).unwrap();

    let mut seen = Vec::new();
    let count = rt.trace(cells[0], |c| seen.push(c)).unwrap();

    assert_eq!(count, 5);
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], cells[0]);
    assert!(!seen.contains(&unreachable));
}

#[test]
fn test_root_frames() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let outer = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    rt.add_root(outer);

    rt.push_root_frame();
    let inner = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    rt.add_root(inner);
    rt.gc();
    assert!(rt.is_alive(inner));
    rt.pop_root_frame();

    rt.gc();
    assert!(rt.is_alive(outer));
    assert!(!rt.is_alive(inner));
}

#[test]
fn test_set_root_repoints() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let a = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let b = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let root = rt.add_root(a);

    assert!(rt.set_root(root, b));
    rt.gc();

    assert!(!rt.is_alive(a));
    assert_eq!(rt.root(root), Some(b));
}

#[test]
fn test_large_cells() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let big = rt.allocate(zone, KindId::OBJECT, 400).unwrap();
    rt.store(big, 399, Value::int(7)).unwrap();
    let root = rt.add_root(big);

    rt.gc();
    assert_eq!(rt.get_slot(big, 399).unwrap().as_int(), Some(7));
    assert!(rt.heap_bytes_in_use() >= 401 * 8);

    rt.remove_root(root);
    rt.gc();
    assert!(!rt.is_alive(big));
    assert_eq!(rt.heap_bytes_in_use(), 0);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalized(_slots: &[Value]) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_finalizers_run_on_sweep_and_shutdown() {
    let mut rt = runtime();
    let kind = rt
        .register_kind(KindInfo::new("resource", trace_all_slots).with_finalizer(count_finalized))
        .unwrap();
    let zone = rt.create_zone().unwrap();

    let garbage = rt.allocate(zone, kind, 1).unwrap();
    let kept = rt.allocate_young(zone, kind, 1).unwrap();
    assert!(kept.is_tenured(), "finalizable kinds skip the nursery");
    rt.add_root(kept);

    rt.gc();
    assert!(!rt.is_alive(garbage));
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert_eq!(rt.last_gc_metrics().finalizers_run, 1);

    drop(rt);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 2);
}

#[test]
fn test_independent_runtimes() {
    let mut a = runtime();
    let mut b = runtime();
    let za = a.create_zone().unwrap();
    let zb = b.create_zone().unwrap();
    let cell = a.allocate(za, KindId::OBJECT, 0).unwrap();
    a.add_root(cell);
    b.allocate(zb, KindId::OBJECT, 0).unwrap();

    b.gc();

    assert!(a.is_alive(cell));
    assert_eq!(a.stats().collections, 0);
    assert_eq!(b.stats().collections, 1);
}
