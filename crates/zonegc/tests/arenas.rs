//! Arena and page pool behavior seen through the runtime.

use zonegc::{GcConfig, GcError, GcReason, GcRuntime, KindId};

/// A 255-slot cell fills half an arena.
const HALF_ARENA_SLOTS: usize = 255;

#[test]
fn test_pages_are_released_after_collection() {
    let mut rt = GcRuntime::with_defaults().unwrap();
    let zone = rt.create_zone().unwrap();
    for _ in 0..1000 {
        rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    }
    assert_eq!(rt.zone(zone).unwrap().arena_count(), 4);
    assert_eq!(rt.pages_in_use(), 4);

    rt.gc();

    assert_eq!(rt.zone(zone).unwrap().arena_count(), 0);
    assert_eq!(rt.pages_in_use(), 0);
    assert_eq!(rt.last_gc_metrics().arenas_released, 4);
    assert_eq!(rt.last_gc_metrics().cells_reclaimed, 1000);
}

#[test]
fn test_size_classes_use_separate_arenas() {
    let mut rt = GcRuntime::with_defaults().unwrap();
    let zone = rt.create_zone().unwrap();
    rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    rt.allocate(zone, KindId::OBJECT, 10).unwrap();
    rt.allocate(zone, KindId::OBJECT, 1).unwrap();

    assert_eq!(rt.zone(zone).unwrap().arena_count(), 2);
}

#[test]
fn test_freed_cells_are_reused() {
    let mut rt = GcRuntime::with_defaults().unwrap();
    let zone = rt.create_zone().unwrap();
    let kept = rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    rt.add_root(kept);
    for _ in 0..100 {
        rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    }
    rt.gc();
    for _ in 0..100 {
        rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    }

    assert_eq!(rt.zone(zone).unwrap().arena_count(), 1);
    assert_eq!(rt.zone(zone).unwrap().live_cells(), 101);
}

#[test]
fn test_decommit_returns_idle_chunks() {
    let mut rt = GcRuntime::with_defaults().unwrap();
    let zone = rt.create_zone().unwrap();
    for _ in 0..600 {
        rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    }
    assert_eq!(rt.decommit_free_pages(), 0);

    rt.gc();
    let reserved = rt.heap_bytes_reserved();
    let released = rt.decommit_free_pages();
    assert!(released > 0);
    assert!(released <= reserved);
    assert_eq!(rt.decommit_free_pages(), 0);

    // Decommitted pages come back on demand.
    let cell = rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    assert!(rt.is_alive(cell));
    assert_eq!(rt.pages_in_use(), 1);
}

fn small_heap() -> GcRuntime {
    GcRuntime::new(GcConfig {
        max_heap_bytes: 4 * 4096,
        chunk_pages: 1,
        ..GcConfig::default()
    })
    .unwrap()
}

#[test]
fn test_out_of_memory_after_emergency_collection() {
    let mut rt = small_heap();
    let zone = rt.create_zone().unwrap();
    let roots: Vec<_> = (0..8)
        .map(|_| {
            let cell = rt.allocate(zone, KindId::OBJECT, HALF_ARENA_SLOTS).unwrap();
            rt.add_root(cell)
        })
        .collect();
    assert_eq!(rt.pages_in_use(), 4);

    let result = rt.allocate(zone, KindId::OBJECT, HALF_ARENA_SLOTS);
    assert!(matches!(result, Err(GcError::OutOfMemory { zone: z, .. }) if z == zone));
    assert_eq!(rt.last_gc_metrics().reason, GcReason::OutOfMemory);

    rt.remove_root(roots[0]);
    let cell = rt.allocate(zone, KindId::OBJECT, HALF_ARENA_SLOTS).unwrap();
    assert!(rt.is_alive(cell));
    assert_eq!(rt.pages_in_use(), 4);
}

#[test]
fn test_emergency_collection_frees_garbage_silently() {
    let mut rt = small_heap();
    let zone = rt.create_zone().unwrap();
    for _ in 0..100 {
        rt.allocate(zone, KindId::OBJECT, HALF_ARENA_SLOTS).unwrap();
    }

    assert!(rt.stats().major_collections > 0);
    assert!(rt.pages_in_use() <= 4);
}

#[test]
fn test_large_cells_count_against_the_limit() {
    let mut rt = small_heap();
    let zone = rt.create_zone().unwrap();

    let result = rt.allocate(zone, KindId::OBJECT, 10_000);
    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));

    let big = rt.allocate(zone, KindId::OBJECT, 1000).unwrap();
    assert!(rt.heap_bytes_in_use() >= 1001 * 8);
    assert_eq!(rt.zone(zone).unwrap().arena_count(), 1);
    assert_eq!(rt.pages_in_use(), 0);
    assert!(rt.is_alive(big));
}
