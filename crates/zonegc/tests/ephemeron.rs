//! Tests for weak maps and ephemeron marking.

use zonegc::{GcError, GcRuntime, KindId, Value};

fn runtime() -> GcRuntime {
    GcRuntime::with_defaults().unwrap()
}

// ============================================================================
// Basic operations
// ============================================================================

#[test]
fn test_weak_map_operations() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    let key = rt.allocate(zone, KindId::OBJECT, 0).unwrap();

    assert_eq!(rt.weak_map_get(map, key).unwrap(), None);
    rt.weak_map_set(map, key, Value::int(1)).unwrap();
    rt.weak_map_set(map, key, Value::int(2)).unwrap();
    assert_eq!(rt.weak_map_get(map, key).unwrap(), Some(Value::int(2)));
    assert!(rt.weak_map_has(map, key).unwrap());
    assert_eq!(rt.weak_map_len(map).unwrap(), 1);

    assert!(rt.weak_map_delete(map, key).unwrap());
    assert!(!rt.weak_map_delete(map, key).unwrap());
    assert_eq!(rt.weak_map_len(map).unwrap(), 0);
}

#[test]
fn test_weak_map_rejects_other_cells() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let object = rt.allocate(zone, KindId::OBJECT, 0).unwrap();

    assert_eq!(
        rt.weak_map_get(object, object),
        Err(GcError::UnknownKind(KindId::OBJECT.index()))
    );
    assert!(rt.weak_map_set(object, object, Value::NULL).is_err());
}

// ============================================================================
// Ephemeron semantics
// ============================================================================

#[test]
fn test_value_lives_while_key_lives() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    let key = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let value = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    rt.add_root(map);
    let key_root = rt.add_root(key);
    rt.weak_map_set(map, key, Value::cell(value)).unwrap();

    rt.gc();
    assert!(rt.is_alive(value));
    assert_eq!(rt.weak_map_get(map, key).unwrap(), Some(Value::cell(value)));

    rt.remove_root(key_root);
    rt.gc();
    assert!(!rt.is_alive(key));
    assert!(!rt.is_alive(value));
    assert_eq!(rt.weak_map_len(map).unwrap(), 0);
}

#[test]
fn test_dead_map_drops_its_entries() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    let key = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let value = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    rt.add_root(key);
    rt.weak_map_set(map, key, Value::cell(value)).unwrap();

    rt.gc();

    assert!(!rt.is_alive(map));
    assert!(rt.is_alive(key));
    assert!(!rt.is_alive(value));
    assert!(rt.weak_maps().is_empty());
}

#[test]
fn test_value_does_not_keep_its_key_alive() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    let key = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let value = rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    rt.store(value, 0, Value::cell(key)).unwrap();
    rt.add_root(map);
    rt.weak_map_set(map, key, Value::cell(value)).unwrap();

    rt.gc();

    assert!(!rt.is_alive(key));
    assert!(!rt.is_alive(value));
    assert_eq!(rt.weak_maps().entry_count(), 0);
}

#[test]
fn test_chained_entries_reach_a_fixed_point() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    rt.add_root(map);
    let keys: Vec<_> = (0..10)
        .map(|_| rt.allocate(zone, KindId::OBJECT, 0).unwrap())
        .collect();
    // map[k_i] = k_{i+1}, inserted back to front.
    for i in (0..9).rev() {
        rt.weak_map_set(map, keys[i], Value::cell(keys[i + 1])).unwrap();
    }
    let first = rt.add_root(keys[0]);

    rt.gc();
    assert!(keys.iter().all(|&k| rt.is_alive(k)));
    assert_eq!(rt.weak_map_len(map).unwrap(), 9);

    rt.remove_root(first);
    rt.gc();
    assert!(keys.iter().all(|&k| !rt.is_alive(k)));
    assert_eq!(rt.weak_map_len(map).unwrap(), 0);
}

#[test]
fn test_key_in_uncollected_zone_keeps_value() {
    let mut rt = runtime();
    let z1 = rt.create_zone().unwrap();
    let z2 = rt.create_zone().unwrap();
    let map = rt.new_weak_map(z1).unwrap();
    let key = rt.allocate(z2, KindId::OBJECT, 0).unwrap();
    let value = rt.allocate(z1, KindId::OBJECT, 0).unwrap();
    rt.add_root(map);
    rt.weak_map_set(map, key, Value::cell(value)).unwrap();

    rt.gc_zones(&[z1]).unwrap();
    assert!(rt.is_alive(value));
    assert!(rt.weak_map_has(map, key).unwrap());

    rt.gc();
    assert!(!rt.is_alive(key));
    assert!(!rt.is_alive(value));
    assert!(!rt.weak_map_has(map, key).unwrap());
}

#[test]
fn test_unreached_young_key_entry_is_dropped_by_minor_collection() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let map = rt.new_weak_map(zone).unwrap();
    rt.add_root(map);
    let key = rt.allocate_young(zone, KindId::OBJECT, 0).unwrap();
    let value = rt.allocate_young(zone, KindId::OBJECT, 0).unwrap();
    rt.weak_map_set(map, key, Value::cell(value)).unwrap();

    rt.minor_gc().unwrap();

    assert_eq!(rt.weak_map_len(map).unwrap(), 0);
    assert_eq!(rt.last_gc_metrics().cells_promoted, 0);
}

// ============================================================================
// Mark observers
// ============================================================================

#[test]
fn test_marks_through_two_weak_maps() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let m1 = rt.new_weak_map(zone).unwrap();
    let m2 = rt.new_weak_map(zone).unwrap();
    let k1 = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let k2 = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let v1 = rt.allocate(zone, KindId::OBJECT, 1).unwrap();
    let v2 = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    rt.store(v1, 0, Value::cell(k2)).unwrap();
    rt.weak_map_set(m1, k1, Value::cell(v1)).unwrap();
    rt.weak_map_set(m2, k2, Value::cell(v2)).unwrap();
    let roots = [rt.add_root(m1), rt.add_root(m2), rt.add_root(k1)];

    rt.add_mark_observers(&[m1, m2, k1, k2, v1, v2]).unwrap();
    assert_eq!(rt.get_marks(), vec!["white"; 6]);

    rt.startgc(1).unwrap();
    assert_eq!(rt.gcstate(), "Mark");
    assert_eq!(
        rt.get_marks(),
        vec!["gray", "gray", "black", "white", "white", "white"]
    );

    rt.finish_collection();
    assert_eq!(rt.get_marks(), vec!["black"; 6]);

    for root in roots {
        rt.remove_root(root);
    }
    rt.gc();
    assert_eq!(rt.get_marks(), vec!["dead"; 6]);
}

#[test]
fn test_nulled_weak_map_chain_is_reclaimed() {
    let mut rt = runtime();
    let zone = rt.create_zone().unwrap();
    let key = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let sym2 = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let dummy = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
    let wm1 = rt.new_weak_map(zone).unwrap();
    let wm2 = rt.new_weak_map(zone).unwrap();
    rt.weak_map_set(wm1, key, Value::cell(sym2)).unwrap();
    rt.weak_map_set(wm2, sym2, Value::cell(dummy)).unwrap();
    let roots: Vec<_> = [key, sym2, dummy, wm1, wm2]
        .into_iter()
        .map(|cell| rt.add_root(cell))
        .collect();
    rt.add_mark_observers(&[key, sym2, dummy, wm1, wm2]).unwrap();

    for root in roots {
        rt.remove_root(root);
    }
    rt.gc();

    assert_eq!(rt.get_marks(), vec!["dead"; 5]);
    assert!(rt.weak_maps().is_empty());
}
