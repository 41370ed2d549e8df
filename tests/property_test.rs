use gyre::core::arena::Pool;
use gyre::core::collections::StableList;
use proptest::prelude::*;

proptest! {
    // Whatever the request mix, every handle must resolve to a region of
    // the requested size, and regions must never alias.
    #[test]
    fn arena_allocations_do_not_alias(sizes in prop::collection::vec(1usize..600, 1..64)) {
        let mut pool = Pool::new(1024);
        let bufs: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let buf = pool.alloc(n);
                pool.slice_mut(&buf).fill(i as u8);
                buf
            })
            .collect();

        for (i, (buf, &n)) in bufs.iter().zip(&sizes).enumerate() {
            let region = pool.slice(buf);
            prop_assert_eq!(region.len(), n);
            prop_assert!(region.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn arena_calloc_is_always_zeroed(sizes in prop::collection::vec(1usize..600, 1..32)) {
        let mut pool = Pool::new(512);
        for &n in &sizes {
            let dirty = pool.alloc(n);
            pool.slice_mut(&dirty).fill(0xAA);
            let buf = pool.calloc(n);
            prop_assert!(pool.slice(&buf).iter().all(|&b| b == 0));
        }
    }

    // Pushes may chain parts but must never disturb what is already
    // stored, and iteration must preserve insertion order.
    #[test]
    fn list_preserves_contents_and_order(
        values in prop::collection::vec(any::<u64>(), 1..200),
        nalloc in 1usize..9,
    ) {
        let mut list = StableList::new(nalloc);
        for (i, &v) in values.iter().enumerate() {
            list.push(v);
            prop_assert_eq!(list.get(0), Some(&values[0]));
            prop_assert_eq!(list.get(i), Some(&v));
        }
        prop_assert_eq!(list.len(), values.len());
        let collected: Vec<u64> = list.iter().copied().collect();
        prop_assert_eq!(collected, values);
    }
}
