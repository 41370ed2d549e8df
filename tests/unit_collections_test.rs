use gyre::core::collections::{Array, StableList};

#[test]
fn test_array_tracks_capacity_and_size() {
    let mut a: Array<u32> = Array::with_capacity(4);
    assert_eq!(a.nelts(), 0);
    assert_eq!(a.nalloc(), 4);

    for i in 0..4 {
        a.push(i);
    }
    assert_eq!(a.nelts(), 4);
    assert_eq!(a.nalloc(), 4);
}

#[test]
fn test_array_doubles_when_full() {
    let mut a: Array<u32> = Array::with_capacity(2);
    a.push(1);
    a.push(2);
    a.push(3);
    assert_eq!(a.nelts(), 3);
    assert_eq!(a.nalloc(), 4);
    assert_eq!(a.as_slice(), &[1, 2, 3]);
}

#[test]
fn test_array_zero_capacity_hint_is_usable() {
    let mut a: Array<u32> = Array::with_capacity(0);
    a.push(7);
    a.push(8);
    assert_eq!(a.as_slice(), &[7, 8]);
}

#[test]
fn test_list_chains_fixed_size_parts() {
    let mut l: StableList<u32> = StableList::new(2);
    for i in 0..5 {
        l.push(i);
    }
    assert_eq!(l.len(), 5);
    assert_eq!(l.parts(), 3);
}

#[test]
fn test_list_iteration_drains_parts_in_order() {
    let mut l: StableList<u32> = StableList::new(3);
    for i in 0..8 {
        l.push(i);
    }
    let seen: Vec<u32> = l.iter().copied().collect();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_list_elements_stay_put_across_growth() {
    let mut l: StableList<u32> = StableList::new(2);
    l.push(10);
    let first = l.get(0).unwrap() as *const u32;

    // Chain several more parts; the first element must not move.
    for i in 0..20 {
        l.push(i);
    }
    assert_eq!(l.get(0).unwrap() as *const u32, first);
    assert_eq!(*l.get(0).unwrap(), 10);
    assert_eq!(*l.get(20).unwrap(), 19);
}
