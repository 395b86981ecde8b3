use elinproxy::lsm::item::{CachedItem, get_item};
use elinproxy::server::range::{HttpRange, LIMIT_RANGE, parse_range};

#[test]
fn test_parse_simple_range() {
    let ranges = parse_range("bytes=100-200", LIMIT_RANGE, 10_000)
        .unwrap()
        .unwrap();
    assert_eq!(ranges, vec![HttpRange { start: 100, length: 200 }]);
}

#[test]
fn test_parse_open_ended_range() {
    let ranges = parse_range("bytes=150-", LIMIT_RANGE, 10_000)
        .unwrap()
        .unwrap();
    assert_eq!(ranges, vec![HttpRange { start: 150, length: 10_000 }]);
}

#[test]
fn test_parse_suffix_range() {
    let ranges = parse_range("bytes=-50", LIMIT_RANGE, 10_000)
        .unwrap()
        .unwrap();
    assert_eq!(ranges, vec![HttpRange { start: 0, length: 50 }]);
}

#[test]
fn test_parse_multi_range_keeps_all_but_only_first_is_served() {
    let ranges = parse_range("bytes=0-0,-1", LIMIT_RANGE, 10_000)
        .unwrap()
        .unwrap();
    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0], HttpRange { start: 0, length: 0 });
    assert_eq!(ranges[1], HttpRange { start: 0, length: 1 });
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(parse_range("lines=1-2", LIMIT_RANGE, 10_000).is_err());
    assert!(parse_range("bytes=abc-def", LIMIT_RANGE, 10_000).is_err());
    assert!(parse_range("bytes=", LIMIT_RANGE, 10_000).is_err());
}

#[test]
fn test_parse_absent_header_or_empty_body() {
    assert!(parse_range("", LIMIT_RANGE, 10_000).unwrap().is_none());
    assert!(parse_range("bytes=0-10", LIMIT_RANGE, 0).unwrap().is_none());
}

#[test]
fn test_range_replay_matches_full_body() {
    let body: Vec<u8> = (0..10_240).map(|i| (i % 255) as u8).collect();
    let mut itm = get_item(body.len());
    itm.write(&body).unwrap();
    let item = CachedItem::Mem(itm);

    let ranges = parse_range("bytes=100-199", LIMIT_RANGE, item.len() as i64)
        .unwrap()
        .unwrap();
    let (from, to, length) = item.valid_range(ranges[0].start, ranges[0].length).unwrap();
    assert_eq!((from, to, length), (100, 200, 100));

    let mut partial = Vec::new();
    item.write_range_to(&mut partial, from, to).unwrap();

    let mut full = Vec::new();
    item.write_to(&mut full).unwrap();

    assert_eq!(partial.len(), 100);
    assert_eq!(partial, &full[100..200]);
}
