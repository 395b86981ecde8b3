use elinproxy::lsm::item::{CachedItem, get_item};
use elinproxy::lsm::vlog::{END_RECORD_MARK, Vlog};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn mem_item(key: u64, body: &[u8]) -> Arc<CachedItem> {
    let mut itm = get_item(body.len());
    itm.key = key;
    itm.status_code = http::StatusCode::OK;
    itm.header
        .insert("content-type", "text/plain".parse().unwrap());
    itm.header
        .insert("x-testing", "testing header".parse().unwrap());
    itm.write(body).unwrap();
    Arc::new(CachedItem::Mem(itm))
}

#[tokio::test]
async fn test_vlog_migrates_item_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (after_tx, mut after_rx) = mpsc::channel(16);
    let vlog = Vlog::new(dir.path().to_path_buf(), after_tx);

    let body = b"some cached response body".to_vec();
    vlog.set(mem_item(7, &body), Duration::from_secs(600)).await;

    let migrated = tokio::time::timeout(Duration::from_secs(5), after_rx.recv())
        .await
        .expect("migration within budget")
        .expect("after-write delivered");

    assert_eq!(migrated.ttl, Duration::from_secs(600));
    let disk = match migrated.item.as_ref() {
        CachedItem::Disk(d) => d,
        CachedItem::Mem(_) => panic!("expected a disk item"),
    };
    assert_eq!(disk.key, 7);
    assert_eq!(disk.body_size as usize, body.len());
    assert!(disk.head_size > 0);

    // The disk twin serves the same bytes and headers.
    assert_eq!(migrated.item.bytes().unwrap(), body);
    let headers = migrated.item.header().unwrap();
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
}

#[tokio::test]
async fn test_vlog_record_carries_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let (after_tx, mut after_rx) = mpsc::channel(16);
    let vlog = Vlog::new(dir.path().to_path_buf(), after_tx);

    vlog.set(mem_item(1, b"abc"), Duration::from_secs(600)).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), after_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let mut segments = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(segments.len(), 1);
    let raw = std::fs::read(segments.pop().unwrap()).unwrap();
    assert!(raw.ends_with(END_RECORD_MARK));
    assert!(raw.windows(4).any(|w| w == b"\r\n\r\n"));
}

#[tokio::test]
async fn test_vlog_one_writer_per_ttl_class() {
    let dir = tempfile::tempdir().unwrap();
    let (after_tx, mut after_rx) = mpsc::channel(64);
    let vlog = Vlog::new(dir.path().to_path_buf(), after_tx);

    for i in 0..8u64 {
        vlog.set(mem_item(i, b"same class"), Duration::from_secs(600))
            .await;
    }
    for i in 0..8u64 {
        vlog.set(mem_item(100 + i, b"other class"), Duration::from_secs(1200))
            .await;
    }

    let mut received = 0;
    while received < 16 {
        tokio::time::timeout(Duration::from_secs(5), after_rx.recv())
            .await
            .expect("migrations within budget")
            .expect("after-write delivered");
        received += 1;
    }

    // One segment per TTL class, both still current.
    let segments = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(segments, 2);
}

#[tokio::test]
async fn test_vlog_records_are_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let (after_tx, mut after_rx) = mpsc::channel(16);
    let vlog = Vlog::new(dir.path().to_path_buf(), after_tx);

    vlog.set(mem_item(1, b"first"), Duration::from_secs(600)).await;
    vlog.set(mem_item(2, b"second"), Duration::from_secs(600)).await;

    let a = after_rx.recv().await.unwrap();
    let b = after_rx.recv().await.unwrap();

    let (a, b) = match (a.item.as_ref(), b.item.as_ref()) {
        (CachedItem::Disk(x), CachedItem::Disk(y)) => {
            ((x.off, x.head_size, x.body_size), (y.off, y.head_size, y.body_size))
        }
        _ => panic!("expected disk items"),
    };

    // Second record starts right after the first one's sentinel.
    assert_eq!(
        b.0,
        a.0 + a.1 + a.2 + END_RECORD_MARK.len() as i64
    );
}
