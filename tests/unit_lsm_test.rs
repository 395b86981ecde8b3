use elinproxy::lsm::item::CachedItem;
use elinproxy::lsm::{Lsm, LsmConfig};
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn engine(dir: &std::path::Path, min_lsm_ttl: Duration) -> std::sync::Arc<Lsm> {
    Lsm::new(LsmConfig {
        min_lsm_ttl,
        extra_ttl: Duration::from_secs(10),
        dir: dir.to_path_buf(),
    })
    .unwrap()
}

async fn set_body(lsm: &Lsm, key: u64, body: &[u8], ttl: Duration) {
    let mut itm = lsm.new_item(body.len());
    itm.status_code = http::StatusCode::OK;
    itm.header
        .insert("content-type", "text/plain".parse().unwrap());
    for chunk in body.chunks(64 * 1024) {
        itm.write(chunk).unwrap();
    }
    lsm.set(key, itm, ttl).await;
}

#[tokio::test]
async fn test_lsm_set_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));

    let key = xxh64(b"key+000000001", 0);
    set_body(&lsm, key, b"hello", Duration::from_secs(60)).await;

    let (item, expired) = lsm.get(key).unwrap();
    assert!(!expired);
    assert_eq!(item.bytes().unwrap(), b"hello");
    assert_eq!(item.hit(), 1);
    assert_eq!(item.in_use(), 1);
    item.done();
    assert_eq!(item.in_use(), 0);
}

#[tokio::test]
async fn test_lsm_miss_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));
    assert!(lsm.get(12345).is_err());
}

#[tokio::test]
async fn test_lsm_clears_dir_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("leftover.bin"), b"junk").unwrap();
    let _lsm = engine(dir.path(), Duration::from_secs(3600));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_lsm_migrates_long_ttl_items_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(0));

    let key = xxh64(b"migrate-me", 0);
    let body = pattern(64 * 1024);
    set_body(&lsm, key, &body, Duration::from_secs(600)).await;

    // Wait for the memory item to be swapped for its disk twin.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (item, _) = lsm.get(key).unwrap();
        let is_disk = matches!(item.as_ref(), CachedItem::Disk(_));
        // Reads stay byte-identical before, during and after the swap.
        assert_eq!(item.bytes().unwrap(), body);
        item.done();
        if is_disk {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "item never migrated to disk"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_lsm_spilled_item_survives_migration() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(0));

    let key = xxh64(b"big-body", 0);
    let body = pattern(6 * 1024 * 1024); // crosses the 4 MiB spill threshold
    set_body(&lsm, key, &body, Duration::from_secs(600)).await;

    let (item, _) = lsm.get(key).unwrap();
    assert_eq!(item.len(), body.len());
    assert_eq!(item.bytes().unwrap(), body);
    item.done();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let (item, _) = lsm.get(key).unwrap();
        let is_disk = matches!(item.as_ref(), CachedItem::Disk(_));
        if is_disk {
            assert_eq!(item.bytes().unwrap(), body);
            item.done();
            break;
        }
        item.done();
        assert!(
            tokio::time::Instant::now() < deadline,
            "spilled item never migrated"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_lsm_short_ttl_stays_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));

    let key = xxh64(b"mem-only", 0);
    set_body(&lsm, key, b"transient", Duration::from_secs(30)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let (item, _) = lsm.get(key).unwrap();
    assert!(matches!(item.as_ref(), CachedItem::Mem(_)));
    item.done();
    // No segment file was created for it.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_lsm_delete_removes_key() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));

    let key = xxh64(b"delete-me", 0);
    set_body(&lsm, key, b"gone soon", Duration::from_secs(60)).await;
    assert!(lsm.get(key).is_ok());

    lsm.delete(key);
    assert!(lsm.get(key).is_err());
    assert_eq!(lsm.len(), 0);
}

#[tokio::test]
async fn test_lsm_eviction_defers_while_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));

    let key = xxh64(b"held", 0);
    set_body(&lsm, key, b"held body", Duration::from_secs(1)).await;

    let (item, _) = lsm.get(key).unwrap();
    assert_eq!(item.in_use(), 1);

    // Let the sweeper evict the expired entry while we still hold it; the
    // body must remain readable until done().
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(lsm.get(key).is_err());
    assert_eq!(item.bytes().unwrap(), b"held body");
    item.done();
}

#[tokio::test]
async fn test_lsm_expired_entries_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = engine(dir.path(), Duration::from_secs(3600));

    for i in 0..20u64 {
        set_body(&lsm, i, b"short lived", Duration::from_secs(1)).await;
    }
    assert_eq!(lsm.len(), 20);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while lsm.len() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sweeper left {} entries",
            lsm.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
