use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use vault_cas::{BlobStore, FsBlobStore, StreamHasher};

fn bench_stream_hash(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024]; // 1MB

    c.bench_function("stream_hash_1mb", |b| {
        b.iter(|| StreamHasher::new().digest(black_box(&data[..])).unwrap())
    });
}

fn bench_stage_and_store(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let store = FsBlobStore::new(temp.path()).unwrap();
    let data = vec![0u8; 1024 * 10]; // 10KB

    c.bench_function("stage_store_10kb", |b| {
        b.iter(|| {
            // Same bytes every iteration: measures the dedup path after the first
            let staged = store.stage(&mut black_box(&data[..]), None).unwrap();
            let location = store.location(&staged.fingerprint());
            store.store(&location, staged).unwrap()
        })
    });
}

fn bench_fetch(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let store = FsBlobStore::new(temp.path()).unwrap();
    let data = vec![0u8; 1024 * 10];
    let staged = store.stage(&mut &data[..], None).unwrap();
    let location = store.location(&staged.fingerprint());
    store.store(&location, staged).unwrap();

    c.bench_function("fetch_10kb", |b| {
        b.iter(|| store.fetch(black_box(&location)).unwrap())
    });
}

criterion_group!(benches, bench_stream_hash, bench_stage_and_store, bench_fetch);
criterion_main!(benches);
