use elinproxy::lsm::item::{CachedItem, get_item};
use proptest::prelude::*;

fn range_strategy() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..4096).prop_flat_map(|len| {
        (Just(len), 0..len)
            .prop_flat_map(|(len, start)| (Just(len), Just(start), (start + 1)..=len))
    })
}

proptest! {
    /// Serving `Range: bytes=s-(e-1)` returns exactly the bytes `[s, e)`
    /// of the full body, with the normalized length `e - s`.
    #[test]
    fn range_replay_matches_full_body((len, start, end) in range_strategy()) {
        let body: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
        let mut itm = get_item(len);
        itm.write(&body).unwrap();
        let item = CachedItem::Mem(itm);

        let (from, to, length) = item
            .valid_range(start as i64, (end - 1) as i64)
            .unwrap();
        prop_assert_eq!(
            (from as usize, to as usize, length as usize),
            (start, end, end - start)
        );

        let mut partial = Vec::new();
        item.write_range_to(&mut partial, from, to).unwrap();
        prop_assert_eq!(&partial[..], &body[start..end]);

        let mut full = Vec::new();
        item.write_to(&mut full).unwrap();
        prop_assert_eq!(&full[start..end], &partial[..]);
    }

    /// Range normalization never produces an inverted or oversized range.
    #[test]
    fn valid_range_is_always_within_body((len, start, end) in range_strategy()) {
        let body: Vec<u8> = vec![0u8; len];
        let mut itm = get_item(len);
        itm.write(&body).unwrap();
        let item = CachedItem::Mem(itm);

        let (from, to, length) = item
            .valid_range(start as i64, (end - 1) as i64)
            .unwrap();
        prop_assert!(from <= to);
        prop_assert!(to <= len as i64);
        prop_assert_eq!(length, to - from);
    }
}
