//! Integration tests for cancellation, cleanup handlers and cancel states.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uthr::{CancelState, CancelType, CondVar, JoinState, Mutex, MutexKind, Runtime, SpinLock};

fn runtime() -> Runtime {
    Runtime::builder().build().expect("build runtime")
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn cleanup_handlers_run_last_in_first_out() {
    let rt = runtime();
    let order = Arc::new(SpinLock::new(Vec::new()));
    let started = Arc::new(AtomicBool::new(false));

    let thread = {
        let inner = rt.clone();
        let order = Arc::clone(&order);
        let started = Arc::clone(&started);
        rt.spawn(move || {
            for n in 1..=3 {
                let order = Arc::clone(&order);
                inner.push_cleanup(move || order.lock().push(n));
            }
            started.store(true, Ordering::Release);
            loop {
                inner.test_cancel();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn")
    };

    wait_until(|| started.load(Ordering::Acquire));
    thread.cancel().expect("cancel");
    assert!(thread.join().expect("join").is_canceled());
    assert_eq!(*order.lock(), vec![3, 2, 1]);
}

#[test]
fn popped_handlers_run_only_when_asked() {
    let rt = runtime();
    let order = Arc::new(SpinLock::new(Vec::new()));

    let thread = {
        let inner = rt.clone();
        let order = Arc::clone(&order);
        rt.spawn(move || {
            for n in 1..=3 {
                let order = Arc::clone(&order);
                inner.push_cleanup(move || order.lock().push(n));
            }
            assert!(inner.pop_cleanup(true));
            assert!(inner.pop_cleanup(false));
        })
        .expect("spawn")
    };

    assert!(!thread.join().expect("join").is_panicked());
    // 3 ran when popped, 2 was discarded, 1 ran at exit.
    assert_eq!(*order.lock(), vec![3, 1]);
}

#[test]
fn disabled_cancel_is_deferred_until_enabled() {
    let rt = runtime();
    let armed = Arc::new(AtomicBool::new(false));
    let go = Arc::new(AtomicBool::new(false));
    let passed = Arc::new(AtomicBool::new(false));

    let thread = {
        let inner = rt.clone();
        let (armed, go, passed) = (Arc::clone(&armed), Arc::clone(&go), Arc::clone(&passed));
        rt.spawn(move || {
            assert_eq!(
                inner.set_cancel_state(CancelState::Disabled),
                CancelState::Enabled
            );
            armed.store(true, Ordering::Release);
            while !go.load(Ordering::Acquire) {
                inner.test_cancel();
                std::thread::sleep(Duration::from_millis(1));
            }
            passed.store(true, Ordering::Release);
            assert_eq!(
                inner.set_cancel_state(CancelState::Enabled),
                CancelState::Disabled
            );
            inner.test_cancel();
            "not cancelled"
        })
        .expect("spawn")
    };

    wait_until(|| armed.load(Ordering::Acquire));
    thread.cancel().expect("cancel");
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(thread.join_state(), JoinState::Joinable);
    go.store(true, Ordering::Release);

    assert!(thread.join().expect("join").is_canceled());
    assert!(passed.load(Ordering::Acquire));
}

#[test]
fn asynchronous_cancel_acts_at_yield() {
    let rt = runtime();
    let armed = Arc::new(AtomicBool::new(false));

    let thread = {
        let inner = rt.clone();
        let armed = Arc::clone(&armed);
        rt.spawn(move || {
            assert_eq!(
                inner.set_cancel_type(CancelType::Asynchronous),
                CancelType::Deferred
            );
            armed.store(true, Ordering::Release);
            loop {
                inner.yield_now();
            }
        })
        .expect("spawn")
    };

    wait_until(|| armed.load(Ordering::Acquire));
    thread.cancel().expect("cancel");
    assert!(thread.join().expect("join").is_canceled());
}

#[test]
fn cancel_interrupts_a_condvar_wait_with_the_mutex_reacquired() {
    let rt = runtime();
    let shared = Arc::new((Mutex::new(&rt, MutexKind::ErrorCheck), CondVar::new(&rt)));
    let held_in_cleanup = Arc::new(AtomicBool::new(false));

    let thread = {
        let inner = rt.clone();
        let shared = Arc::clone(&shared);
        let held_in_cleanup = Arc::clone(&held_in_cleanup);
        rt.spawn(move || {
            let (mutex, cond) = &*shared;
            mutex.lock().expect("lock");
            {
                let shared = Arc::clone(&shared);
                inner.push_cleanup(move || {
                    let (mutex, _) = &*shared;
                    held_in_cleanup.store(mutex.is_locked(), Ordering::SeqCst);
                    mutex.unlock().expect("unlock in cleanup");
                });
            }
            loop {
                cond.wait(mutex).expect("wait");
            }
        })
        .expect("spawn")
    };

    let (mutex, cond) = &*shared;
    wait_until(|| cond.waiters() == 1);
    thread.cancel().expect("cancel");

    assert!(thread.join().expect("join").is_canceled());
    assert!(held_in_cleanup.load(Ordering::SeqCst));
    assert_eq!(cond.waiters(), 0);
    mutex.lock().expect("mutex was released by the handler");
    mutex.unlock().expect("unlock");
    assert_eq!(rt.pool_stats().checked_out, 0);
}

#[test]
fn cancel_interrupts_a_join() {
    let rt = runtime();
    let release = Arc::new(AtomicBool::new(false));

    let sleeper = {
        let release = Arc::clone(&release);
        rt.spawn(move || {
            while !release.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            5u8
        })
        .expect("spawn sleeper")
    };
    let joiner = {
        let sleeper = sleeper.clone();
        rt.spawn(move || sleeper.join().map(|exit| exit.value::<u8>()))
            .expect("spawn joiner")
    };

    wait_until(|| joiner.joining() == Some(sleeper.id()));
    joiner.cancel().expect("cancel joiner");
    assert!(joiner.join().expect("join joiner").is_canceled());

    // The abandoned join left the sleeper joinable.
    assert_eq!(sleeper.join_state(), JoinState::Joinable);
    release.store(true, Ordering::Release);
    assert_eq!(sleeper.join().expect("join sleeper").value::<u8>(), Some(5));
}

#[test]
fn cancel_after_exit_is_harmless() {
    let rt = runtime();
    let thread = rt.spawn(|| 1u8).expect("spawn");
    wait_until(|| thread.join_state() == JoinState::Exited);
    thread.cancel().expect("cancel");
    assert_eq!(thread.join().expect("join").value::<u8>(), Some(1));
}
