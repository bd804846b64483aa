use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use syncguard_core::{build_manifest, generate_checksum, SyncQueueConfig, SyncResult};
use syncguard_engine::{system_clock, SyncQueue};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn payload(bytes: usize) -> String {
    "x".repeat(bytes)
}

fn chunks(count: usize, items_per_chunk: usize) -> BTreeMap<String, Value> {
    (0..count)
        .map(|c| {
            let items: Vec<Value> = (0..items_per_chunk)
                .map(|i| json!({"id": format!("txn-{c}-{i}"), "amount": i, "payee": "Grocer"}))
                .collect();
            (format!("transactions_{c}"), Value::Array(items))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Benchmark: checksum generation
// ---------------------------------------------------------------------------

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for size in [1_024, 64 * 1_024, 1_024 * 1_024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(generate_checksum(data)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: manifest construction
// ---------------------------------------------------------------------------

fn bench_manifest(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_manifest");
    for (count, items) in [(10, 100), (50, 100), (100, 200)] {
        let input = chunks(count, items);
        group.bench_with_input(
            BenchmarkId::new(format!("{}chunks_{}items", count, items), count),
            &input,
            |b, input| {
                b.iter(|| black_box(build_manifest(input, Default::default(), 0).unwrap()));
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: queue enqueue + flush
// ---------------------------------------------------------------------------

async fn store(payload: u64) -> SyncResult<u64> {
    Ok(payload)
}

fn bench_queue_flush(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue_flush");
    for keys in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(keys));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            b.to_async(&rt).iter(|| async move {
                let queue: SyncQueue<u64, u64> = SyncQueue::new(
                    SyncQueueConfig {
                        name: "bench".into(),
                        debounce_ms: 60_000,
                        max_batch_size: 0,
                    },
                    system_clock(),
                );
                // Two writes per key: every first write is superseded.
                for round in 0..2 {
                    for key in 0..keys {
                        drop(queue.enqueue(format!("envelope:{key}"), store, key + round));
                    }
                }
                black_box(queue.flush().await)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_manifest, bench_queue_flush);
criterion_main!(benches);
