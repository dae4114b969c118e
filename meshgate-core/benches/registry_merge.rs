use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshgate_core::core_registry::{decode_snapshot, MergePolicy, Membership, RegistryEntry};
use std::time::Duration;

const NOW_MS: u64 = 1_704_067_200_000;

fn timestamped() -> MergePolicy {
    MergePolicy::Timestamped {
        staleness_window: Duration::from_secs(15 * 60),
    }
}

// Half the names overlap with what the local view already holds
fn remote_view(size: usize) -> Vec<RegistryEntry> {
    (size / 2..size + size / 2)
        .map(|i| RegistryEntry::seen_at(format!("peer-{:05}", i), NOW_MS - (i as u64 % 600) * 1_000))
        .collect()
}

fn local_view(size: usize, policy: MergePolicy) -> Membership {
    let mut known = Membership::new();
    let entries: Vec<RegistryEntry> = (0..size)
        .map(|i| RegistryEntry::seen_at(format!("peer-{:05}", i), NOW_MS - 30_000))
        .collect();
    known.merge_remote(&entries, policy);
    known
}

fn bench_merge_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_merge_remote");

    for size in [10usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        let remote = remote_view(*size);

        for (label, policy) in [("simple", MergePolicy::Simple), ("timestamped", timestamped())] {
            group.bench_with_input(BenchmarkId::new(label, size), size, |b, &n| {
                b.iter_batched(
                    || local_view(n, policy),
                    |mut known| {
                        let changed = known.merge_remote(black_box(&remote), policy);
                        known.upsert_self("peer-00000", NOW_MS, policy);
                        black_box(changed)
                    },
                    criterion::BatchSize::SmallInput,
                );
            });
        }
    }

    group.finish();
}

fn bench_snapshot_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_snapshot");

    for size in [100usize, 1_000].iter() {
        let known = local_view(*size, timestamped());
        let bytes = known.encode().unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &known, |b, known| {
            b.iter(|| black_box(known.encode()))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(decode_snapshot(bytes)))
        });
    }

    group.finish();
}

fn bench_collect_garbage(c: &mut Criterion) {
    let policy = timestamped();
    c.bench_function("registry_collect_garbage_1000", |b| {
        b.iter_batched(
            || local_view(1_000, policy),
            // 20 minutes later every entry but our own is stale
            |mut known| black_box(known.collect_garbage("peer-00000", NOW_MS + 20 * 60 * 1_000, policy)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_merge_remote, bench_snapshot_codec, bench_collect_garbage);
criterion_main!(benches);
