use criterion::{criterion_group, criterion_main, Criterion};
use quire_core::{Replica, ReplicaConfig, ReplicaId, StateVector};
use std::hint::black_box;
use std::time::Instant;

fn seeded_replica(chars: usize) -> Replica {
    let mut replica = Replica::new(ReplicaConfig::default());
    let line = "the quick brown fox jumps over the lazy dog\n";
    while replica.len() < chars {
        let len = replica.len();
        replica.insert(len, line).unwrap();
    }
    replica
}

fn bench_local_typing(c: &mut Criterion) {
    c.bench_function("local_insert_1k_chars", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaConfig::default());
            for i in 0..1_000 {
                replica.insert(black_box(i), "x").unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_local_insert_mid_document(c: &mut Criterion) {
    let base = seeded_replica(10_000);

    c.bench_function("local_insert_mid_10k_doc", |b| {
        b.iter_batched(
            || Replica::from_snapshot(ReplicaId::random(), &base.snapshot(), ReplicaConfig::default()).unwrap(),
            |mut replica| {
                replica.insert(black_box(5_000), "hello").unwrap();
                black_box(replica.len());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_remote_integration(c: &mut Criterion) {
    let source = seeded_replica(2_000);
    let ops = source.compute_delta(&StateVector::new());

    c.bench_function("integrate_2k_char_history", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaConfig::default());
            let now = Instant::now();
            for op in ops.iter() {
                replica.integrate(op.clone(), now).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_reverse_delivery(c: &mut Criterion) {
    let mut source = Replica::new(ReplicaConfig::default());
    for i in 0..500 {
        source.insert(i, "y").unwrap();
    }
    let mut ops = source.compute_delta(&StateVector::new());
    ops.reverse();

    c.bench_function("integrate_500_ops_reverse_order", |b| {
        b.iter(|| {
            let mut replica = Replica::new(ReplicaConfig::default());
            let now = Instant::now();
            for op in ops.iter() {
                replica.integrate(op.clone(), now).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let source = seeded_replica(10_000);

    c.bench_function("snapshot_restore_10k", |b| {
        b.iter(|| {
            let snapshot = source.snapshot();
            black_box(Replica::from_snapshot(ReplicaId::random(), &snapshot, ReplicaConfig::default()).unwrap());
        })
    });
}

fn bench_state_vector_digest(c: &mut Criterion) {
    let mut sv = StateVector::new();
    for i in 0..64 {
        sv.advance(ReplicaId::random(), i * 100 + 1);
    }

    c.bench_function("state_vector_digest_64", |b| {
        b.iter(|| black_box(black_box(&sv).digest()))
    });
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_local_insert_mid_document,
    bench_remote_integration,
    bench_reverse_delivery,
    bench_snapshot,
    bench_state_vector_digest,
);
criterion_main!(benches);
