//! Transaction throughput benchmarks
//!
//! Runs against an in-process cluster on wall-clock time:
//! - single-threaded commits touching one or several tablets
//! - multi-threaded commits on disjoint keys
//! - multi-threaded increments of one hot key, retried on conflict

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use strata_core::Key;
use strata_engine::{LocalCluster, RetryConfig, Session, TxnConfig};

fn cluster() -> Arc<LocalCluster> {
    LocalCluster::start(4, TxnConfig::default()).unwrap()
}

/// Benchmark: single-threaded transactions (no contention)
fn bench_single_threaded_transactions(c: &mut Criterion) {
    let cluster = cluster();
    let manager = cluster.transaction_manager();

    let mut group = c.benchmark_group("single_threaded");
    group.throughput(Throughput::Elements(1));

    group.bench_function("write_commit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let txn = manager.begin();
            txn.write(format!("key_{}", i), i as i64).unwrap();
            black_box(txn.commit().wait().unwrap());
            i += 1;
        });
    });

    group.bench_function("read_only", |b| {
        let txn = manager.begin();
        txn.write("read_only_key", 1).unwrap();
        txn.commit().wait().unwrap();
        b.iter(|| {
            let session = Session::begin(&manager);
            black_box(session.read("read_only_key").unwrap());
            session.commit().unwrap();
        });
    });

    group.bench_function("multi_tablet_commit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let txn = manager.begin();
            for k in 0..8 {
                txn.write(format!("multi_{}_{}", i, k), k as i64).unwrap();
            }
            black_box(txn.commit().wait().unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark: multi-threaded transactions (no conflicts, different keys)
fn bench_multi_threaded_no_conflict(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_threaded_no_conflict");

    for num_threads in [2, 4, 8] {
        group.throughput(Throughput::Elements(num_threads as u64));
        group.bench_with_input(
            BenchmarkId::new("threads", num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let cluster = cluster();
                    let start = std::time::Instant::now();
                    let handles: Vec<_> = (0..num_threads)
                        .map(|thread_id| {
                            let manager = cluster.transaction_manager();
                            thread::spawn(move || {
                                for i in 0..iters {
                                    let txn = manager.begin();
                                    txn.write(format!("t{}_{}", thread_id, i), i as i64)
                                        .unwrap();
                                    txn.commit().wait().unwrap();
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    let elapsed = start.elapsed();
                    cluster.shutdown();
                    elapsed
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: multi-threaded increments of one key (conflicts retried)
fn bench_multi_threaded_with_conflict(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_threaded_with_conflict");
    let retry = RetryConfig::transactions(1_000);

    for num_threads in [2, 4] {
        group.throughput(Throughput::Elements(num_threads as u64));
        group.bench_with_input(
            BenchmarkId::new("threads", num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let cluster = cluster();
                    let start = std::time::Instant::now();
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let manager = cluster.transaction_manager();
                            let retry = retry.clone();
                            thread::spawn(move || {
                                for _ in 0..iters {
                                    Session::run_with_retry(&manager, &retry, |s| {
                                        let key = Key::from("hot");
                                        let n = s
                                            .read(key.clone())?
                                            .and_then(|v| v.as_int())
                                            .unwrap_or(0);
                                        s.write(key, n + 1)
                                    })
                                    .unwrap();
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    let elapsed = start.elapsed();
                    cluster.shutdown();
                    elapsed
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_threaded_transactions,
    bench_multi_threaded_no_conflict,
    bench_multi_threaded_with_conflict,
);
criterion_main!(benches);
