// benches/kvsm_bench.rs

use criterion::{Criterion, criterion_group, criterion_main};
use elinproxy::lsm::item::{CachedItem, get_item};
use elinproxy::lsm::kvsm::Kvsm;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn mem_value(key: u64) -> Arc<CachedItem> {
    let mut itm = get_item(64);
    itm.key = key;
    itm.write(b"benchmark value").unwrap();
    Arc::new(CachedItem::Mem(itm))
}

fn kvsm_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let kv = rt.block_on(async { Kvsm::new() });

    rt.block_on(async {
        for i in 0..10u64 {
            kv.set(i, mem_value(i), Duration::from_secs(600)).await;
        }
    });

    c.bench_function("kvsm_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(kv.get(i % 10));
        })
    });

    c.bench_function("kvsm_set", |b| {
        let mut i = 100u64;
        b.to_async(&rt).iter(|| {
            i += 1;
            let kv = &kv;
            async move { kv.set(i, mem_value(i), Duration::from_secs(600)).await }
        })
    });

    c.bench_function("kvsm_swap", |b| {
        let mut i = 0u64;
        b.to_async(&rt).iter(|| {
            i += 1;
            let kv = &kv;
            async move {
                kv.swap(i % 10, mem_value(i % 10), Duration::from_secs(600))
                    .await
            }
        })
    });
}

criterion_group!(benches, kvsm_benchmark);
criterion_main!(benches);
