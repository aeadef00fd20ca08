//! Fast paths that never reach the kernel: uncontended locking and signals
//! with nobody waiting.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use uthr::{CondVar, Mutex, MutexKind, RwLock, Runtime, SpinLock};

fn bench_mutex(c: &mut Criterion) {
    let rt = Runtime::builder().build().expect("build runtime");
    let mut group = c.benchmark_group("mutex_lock_unlock");

    for kind in [MutexKind::Normal, MutexKind::Recursive, MutexKind::ErrorCheck] {
        let mutex = Mutex::new(&rt, kind);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{kind:?}")),
            &mutex,
            |b, mutex| {
                b.iter(|| {
                    mutex.lock().expect("lock");
                    mutex.unlock().expect("unlock");
                });
            },
        );
    }
    group.finish();
}

fn bench_signal_without_waiters(c: &mut Criterion) {
    let rt = Runtime::builder().build().expect("build runtime");
    let cond = CondVar::new(&rt);

    c.bench_function("condvar_signal_no_waiters", |b| {
        b.iter(|| cond.signal().expect("signal"));
    });
    c.bench_function("condvar_broadcast_no_waiters", |b| {
        b.iter(|| cond.broadcast().expect("broadcast"));
    });
}

fn bench_rwlock(c: &mut Criterion) {
    let rt = Runtime::builder().build().expect("build runtime");
    let lock = RwLock::new(&rt);

    c.bench_function("rwlock_read_unlock", |b| {
        b.iter(|| {
            lock.read_lock().expect("read");
            lock.unlock().expect("unlock");
        });
    });
    c.bench_function("rwlock_write_unlock", |b| {
        b.iter(|| {
            lock.write_lock().expect("write");
            lock.unlock().expect("unlock");
        });
    });
}

fn bench_spinlock(c: &mut Criterion) {
    let lock = SpinLock::new(0u64);
    c.bench_function("spinlock_lock_unlock", |b| {
        b.iter(|| {
            *lock.lock() += 1;
            black_box(&lock);
        });
    });
}

criterion_group!(
    benches,
    bench_mutex,
    bench_signal_without_waiters,
    bench_rwlock,
    bench_spinlock
);
criterion_main!(benches);
