//! Integration tests for the runtime trace hook.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uthr::{CondVar, Mutex, MutexKind, Runtime, SpinLock, TraceHook, TraceKind, TraceRecord};

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn traced_runtime() -> (Runtime, Arc<SpinLock<Vec<TraceRecord>>>) {
    let records = Arc::new(SpinLock::new(Vec::new()));
    let hook: TraceHook = {
        let records = Arc::clone(&records);
        Arc::new(move |record: &TraceRecord| records.lock().push(*record))
    };
    let rt = Runtime::builder()
        .with_trace_hook(hook)
        .build()
        .expect("build runtime");
    (rt, records)
}

type Shared = Arc<(Mutex, CondVar, AtomicU32)>;

fn spawn_waiter(rt: &Runtime, shared: &Shared, until: u32) -> uthr::Thread {
    let shared = Arc::clone(shared);
    rt.spawn(move || {
        let (mutex, cond, stage) = &*shared;
        mutex.lock().expect("lock");
        while stage.load(Ordering::Acquire) < until {
            cond.wait(mutex).expect("wait");
        }
        mutex.unlock().expect("unlock");
    })
    .expect("spawn waiter")
}

fn advance(shared: &Shared, stage: u32, broadcast: bool) {
    let (mutex, cond, current) = &**shared;
    mutex.lock().expect("lock");
    current.store(stage, Ordering::Release);
    if broadcast {
        cond.broadcast().expect("broadcast");
    } else {
        cond.signal().expect("signal");
    }
    mutex.unlock().expect("unlock");
}

#[test]
fn every_record_kind_is_emitted() {
    let (rt, records) = traced_runtime();
    let shared: Shared = Arc::new((
        Mutex::new(&rt, MutexKind::Normal),
        CondVar::new(&rt),
        AtomicU32::new(0),
    ));

    let (mutex, cond, _) = &*shared;
    mutex.lock().expect("lock");
    let contender = {
        let shared = Arc::clone(&shared);
        rt.spawn(move || {
            let (mutex, _, _) = &*shared;
            mutex.lock().expect("contended lock");
            mutex.unlock().expect("unlock");
        })
        .expect("spawn contender")
    };
    wait_until(|| mutex.waiters() == 1);
    mutex.unlock().expect("hand over");
    contender.join().expect("join contender");

    let waiter = spawn_waiter(&rt, &shared, 1);
    wait_until(|| cond.waiters() == 1);
    advance(&shared, 1, false);
    waiter.join().expect("join signalled waiter");

    let waiter = spawn_waiter(&rt, &shared, 2);
    wait_until(|| cond.waiters() == 1);
    advance(&shared, 2, true);
    waiter.join().expect("join broadcast waiter");

    let seen: Vec<TraceKind> = records.lock().iter().map(|record| record.kind).collect();
    for kind in [
        TraceKind::MutexContended,
        TraceKind::MutexHandoff,
        TraceKind::CondWait,
        TraceKind::CondSignal,
        TraceKind::CondBroadcast,
        TraceKind::ThreadCreate,
        TraceKind::ThreadExit,
        TraceKind::ThreadReap,
        TraceKind::PoolGrow,
    ] {
        assert!(seen.contains(&kind), "{kind:?} missing from {seen:?}");
    }
}

#[test]
fn thread_records_carry_the_thread_id() {
    let (rt, records) = traced_runtime();
    let thread = rt.spawn(|| ()).expect("spawn");
    let id = thread.id();
    thread.join().expect("join");

    let kinds: Vec<TraceKind> = records
        .lock()
        .iter()
        .filter(|record| record.thread == Some(id))
        .map(|record| record.kind)
        .collect();
    // The thread may exit before its creation record is emitted.
    assert_eq!(kinds.len(), 3, "{kinds:?}");
    for kind in [TraceKind::ThreadCreate, TraceKind::ThreadExit, TraceKind::ThreadReap] {
        assert!(kinds.contains(&kind), "{kind:?} missing from {kinds:?}");
    }
    assert_eq!(kinds.last(), Some(&TraceKind::ThreadReap));
}
