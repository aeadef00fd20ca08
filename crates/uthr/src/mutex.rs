//! Exclusive lock with normal, recursive and error-checking kinds.
//!
//! Uncontended lock and unlock touch only the control block. The first thread
//! to queue behind an owner borrows two pool semaphores: a *ticket* that
//! admits one queued thread at a time to the head of the queue, and a
//! *signal* on which only the head waits. A releaser that sees waiters does
//! not clear ownership; it marks it [`Owner::Transfer`] and posts the signal,
//! and the woken head claims it from there. The last head to claim returns
//! both semaphores to the pool.

use core::fmt;
use std::sync::OnceLock;

use log::{error, trace};

use crate::error::{Error, Result};
use crate::object::{ObjectId, SigState, Signature, SIG_MUTEX};
use crate::pool::{self, SemLease};
use crate::runtime::Runtime;
use crate::spinlock::SpinLock;
use crate::thread::{cancel, ThreadId};
use crate::trace::TraceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// Relocking by the owner deadlocks.
    #[default]
    Normal,
    /// The owner may relock; each lock needs a matching unlock.
    Recursive,
    /// Relocking by the owner fails with `WouldDeadlock`.
    ErrorCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Unowned,
    Owned(ThreadId),
    /// Released to a queued thread that has not claimed it yet.
    Transfer,
}

struct MutexState {
    owner: Owner,
    count: u32,
    waiters: u32,
    /// A queued thread holds, or is about to take, the head position.
    head: bool,
    ticket: Option<SemLease>,
    signal: Option<SemLease>,
}

pub(crate) struct Binding {
    pub(crate) rt: Runtime,
    pub(crate) id: ObjectId,
}

pub struct Mutex {
    sig: Signature,
    kind: MutexKind,
    binding: OnceLock<Binding>,
    state: SpinLock<MutexState>,
}

impl Mutex {
    pub fn new(rt: &Runtime, kind: MutexKind) -> Self {
        let binding = OnceLock::new();
        let _ = binding.set(Binding {
            rt: rt.clone(),
            id: ObjectId::next(),
        });
        Self {
            sig: Signature::new_live(SIG_MUTEX, "mutex"),
            kind,
            binding,
            state: SpinLock::new(MutexState::new()),
        }
    }

    /// Static initializer. Binds to [`Runtime::global`] on first lock.
    pub const fn new_static(kind: MutexKind) -> Self {
        Self {
            sig: Signature::new_static(SIG_MUTEX, "mutex"),
            kind,
            binding: OnceLock::new(),
            state: SpinLock::new(MutexState::new()),
        }
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// `None` until a static mutex is first used.
    pub fn id(&self) -> Option<ObjectId> {
        self.binding.get().map(|b| b.id)
    }

    pub fn owner(&self) -> Owner {
        self.state.lock().owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner() != Owner::Unowned
    }

    /// Threads queued for ownership.
    pub fn waiters(&self) -> u32 {
        self.state.lock().waiters
    }

    pub fn lock(&self) -> Result<()> {
        let binding = self.bind()?;
        let me = binding.rt.current_record();
        cancel::async_point(&me);
        self.acquire(binding, me.id)
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Never blocks: `Busy` when held by another thread or handed over.
    pub fn try_lock(&self) -> Result<()> {
        let binding = self.bind()?;
        let me = binding.rt.current_record().id;
        let mut state = self.state.lock();
        self.sig.check_live()?;
        let owner = state.owner;
        match owner {
            Owner::Unowned => {
                state.owner = Owner::Owned(me);
                state.count = 1;
                Ok(())
            }
            Owner::Owned(owner) if owner == me && self.kind == MutexKind::Recursive => {
                state.count = state
                    .count
                    .checked_add(1)
                    .ok_or(Error::ResourceExhausted("recursion depth"))?;
                Ok(())
            }
            _ => Err(Error::Busy),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let binding = self.binding()?;
        let me = binding.rt.current_record().id;
        self.release(binding, me, false).map(|_| ())
    }

    /// Fails with `Busy` while locked, waited on, or in use by a condition
    /// variable wait. Later operations fail with `InvalidArgument`.
    pub fn destroy(&self) -> Result<()> {
        let state = self.state.lock();
        if self.sig.state()? == SigState::Static {
            self.sig.retire();
            return Ok(());
        }
        if state.owner != Owner::Unowned || state.waiters > 0 {
            return Err(Error::Busy);
        }
        if let Some(binding) = self.binding.get() {
            if binding.rt.assoc().is_linked(binding.id) {
                return Err(Error::Busy);
            }
        }
        self.sig.retire();
        Ok(())
    }

    /// Live binding, binding a static mutex to the global runtime first.
    fn bind(&self) -> Result<&Binding> {
        if self.sig.state()? == SigState::Static {
            self.binding.get_or_init(|| Binding {
                rt: Runtime::global().clone(),
                id: ObjectId::next(),
            });
            self.sig.promote();
        }
        self.binding()
    }

    /// Live binding without lazy initialization.
    pub(crate) fn binding(&self) -> Result<&Binding> {
        self.sig.check_live()?;
        self.binding
            .get()
            .ok_or(Error::InvalidArgument("uninitialized object"))
    }

    pub(crate) fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.state.lock().owner == Owner::Owned(thread)
    }

    /// Fully releases the caller's ownership for a condition variable wait
    /// and returns the recursion count to restore.
    pub(crate) fn release_for_wait(&self, me: ThreadId) -> Result<u32> {
        let binding = self.binding()?;
        self.release(binding, me, true)
    }

    /// Takes ownership back after a condition variable wait.
    pub(crate) fn reacquire(&self, me: ThreadId, count: u32) -> Result<()> {
        let binding = self.binding()?;
        self.acquire(binding, me)?;
        self.state.lock().count = count;
        Ok(())
    }

    fn acquire(&self, binding: &Binding, me: ThreadId) -> Result<()> {
        let rt = &binding.rt;
        let mut state = self.state.lock();
        self.sig.check_live()?;
        let owner = state.owner;
        match owner {
            Owner::Unowned => {
                state.owner = Owner::Owned(me);
                state.count = 1;
                return Ok(());
            }
            Owner::Owned(owner) if owner == me => match self.kind {
                MutexKind::Recursive => {
                    state.count = state
                        .count
                        .checked_add(1)
                        .ok_or(Error::ResourceExhausted("recursion depth"))?;
                    return Ok(());
                }
                MutexKind::ErrorCheck => return Err(Error::WouldDeadlock),
                // Queues behind itself, as the kind promises.
                MutexKind::Normal => {}
            },
            _ => {}
        }

        state.waiters += 1;
        if state.signal.is_none() {
            let pool = rt.pool();
            match (pool.checkout(), pool.checkout()) {
                (Ok(ticket), Ok(signal)) => {
                    state.ticket = Some(ticket);
                    state.signal = Some(signal);
                }
                (Err(err), _) | (_, Err(err)) => {
                    state.waiters -= 1;
                    drop(state);
                    error!("mutex {}: no semaphore for first waiter: {err}", binding.id);
                    panic!("mutex {}: no semaphore for first waiter: {err}", binding.id);
                }
            }
        }
        let (ticket, signal) = match (state.ticket.as_ref(), state.signal.as_ref()) {
            (Some(ticket), Some(signal)) => (ticket.handle(), signal.handle()),
            _ => self.corrupted(binding),
        };
        let queued = state.waiters;
        let behind_head = state.head;
        state.head = true;
        drop(state);
        rt.emit(TraceKind::MutexContended, Some(binding.id), Some(me), queued as u64);
        trace!("mutex {}: {me} queued, {queued} waiting", binding.id);

        if behind_head {
            pool::wait(rt.kern(), ticket, None);
        }
        let mut state = loop {
            pool::wait(rt.kern(), signal, None);
            let state = self.state.lock();
            if state.owner == Owner::Transfer {
                break state;
            }
        };

        state.owner = Owner::Owned(me);
        state.count = 1;
        state.waiters -= 1;
        let mut pass_ticket = false;
        let mut leases = (None, None);
        if state.waiters > 0 {
            pass_ticket = true;
        } else {
            state.head = false;
            leases = (state.ticket.take(), state.signal.take());
        }
        drop(state);

        if pass_ticket {
            pool::post(rt.kern(), ticket);
        }
        drop(leases);
        Ok(())
    }

    fn release(&self, binding: &Binding, me: ThreadId, for_wait: bool) -> Result<u32> {
        let rt = &binding.rt;
        let mut state = self.state.lock();
        self.sig.check_live()?;
        let owner = state.owner;
        match owner {
            Owner::Owned(owner) if owner == me => {}
            Owner::Owned(_)
                if self.kind == MutexKind::Normal
                    && !for_wait
                    && rt.config().legacy_normal_unlock => {}
            _ => return Err(Error::NotOwner),
        }

        if self.kind == MutexKind::Recursive && state.count > 1 && !for_wait {
            state.count -= 1;
            return Ok(state.count);
        }

        let saved = state.count;
        state.count = 0;
        if state.waiters == 0 {
            state.owner = Owner::Unowned;
            return Ok(saved);
        }

        state.owner = Owner::Transfer;
        let signal = match state.signal.as_ref() {
            Some(signal) => signal.handle(),
            None => self.corrupted(binding),
        };
        let waiters = state.waiters;
        drop(state);

        pool::post(rt.kern(), signal);
        rt.emit(TraceKind::MutexHandoff, Some(binding.id), Some(me), waiters as u64);
        Ok(saved)
    }

    fn corrupted(&self, binding: &Binding) -> ! {
        error!("mutex {}: waiters without semaphores", binding.id);
        panic!("mutex {}: waiters without semaphores", binding.id);
    }
}

impl MutexState {
    const fn new() -> Self {
        Self {
            owner: Owner::Unowned,
            count: 0,
            waiters: 0,
            head: false,
            ticket: None,
            signal: None,
        }
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("owner", &state.owner)
            .field("count", &state.count)
            .field("waiters", &state.waiters)
            .finish()
    }
}

/// Unlocks its mutex when dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl MutexGuard<'_> {
    pub fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            error!("mutex guard: unlock failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn runtime() -> Runtime {
        Runtime::builder().build().unwrap()
    }

    #[test]
    fn uncontended_path_never_touches_the_pool() {
        let rt = runtime();
        let mutex = Mutex::new(&rt, MutexKind::Normal);
        for _ in 0..100 {
            mutex.lock().unwrap();
            mutex.unlock().unwrap();
        }
        assert_eq!(rt.pool_stats().capacity, 0);
    }

    #[test]
    fn recursive_counts_nest() {
        let rt = runtime();
        let mutex = Mutex::new(&rt, MutexKind::Recursive);
        for _ in 0..3 {
            mutex.lock().unwrap();
        }
        assert!(mutex.try_lock().is_ok());
        for _ in 0..4 {
            mutex.unlock().unwrap();
        }
        assert_eq!(mutex.owner(), Owner::Unowned);
        assert_eq!(mutex.unlock(), Err(Error::NotOwner));
    }

    #[test]
    fn error_check_relock() {
        let rt = runtime();
        let mutex = Mutex::new(&rt, MutexKind::ErrorCheck);
        mutex.lock().unwrap();
        assert_eq!(mutex.lock(), Err(Error::WouldDeadlock));
        assert_eq!(mutex.try_lock(), Err(Error::Busy));
        mutex.unlock().unwrap();
    }

    #[test]
    fn try_lock_reports_busy_across_threads() {
        let rt = runtime();
        let mutex = Arc::new(Mutex::new(&rt, MutexKind::Normal));
        mutex.lock().unwrap();

        let other = Arc::clone(&mutex);
        let result = std::thread::spawn(move || other.try_lock())
            .join()
            .unwrap();
        assert_eq!(result, Err(Error::Busy));
        mutex.unlock().unwrap();
    }

    #[test]
    fn non_owner_unlock_is_rejected() {
        let rt = runtime();
        let mutex = Arc::new(Mutex::new(&rt, MutexKind::Normal));
        mutex.lock().unwrap();

        let other = Arc::clone(&mutex);
        let result = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert_eq!(result, Err(Error::NotOwner));
        assert!(mutex.is_owned_by(rt.current_record().id));
        mutex.unlock().unwrap();
    }

    #[test]
    fn legacy_normal_unlock_skips_owner_check() {
        let rt = Runtime::builder()
            .config(
                crate::RuntimeConfig::builder()
                    .legacy_normal_unlock(true)
                    .build(),
            )
            .build()
            .unwrap();
        let normal = Arc::new(Mutex::new(&rt, MutexKind::Normal));
        let checked = Arc::new(Mutex::new(&rt, MutexKind::ErrorCheck));
        normal.lock().unwrap();
        checked.lock().unwrap();

        let (n, c) = (Arc::clone(&normal), Arc::clone(&checked));
        let (released, refused) = std::thread::spawn(move || (n.unlock(), c.unlock()))
            .join()
            .unwrap();
        assert_eq!(released, Ok(()));
        assert_eq!(refused, Err(Error::NotOwner));
        assert_eq!(normal.owner(), Owner::Unowned);
        checked.unlock().unwrap();
    }

    #[test]
    fn destroy_rules() {
        let rt = runtime();
        let mutex = Mutex::new(&rt, MutexKind::Normal);
        mutex.lock().unwrap();
        assert_eq!(mutex.destroy(), Err(Error::Busy));
        mutex.unlock().unwrap();
        mutex.destroy().unwrap();

        assert_eq!(mutex.lock(), Err(Error::InvalidArgument("destroyed object")));
        assert_eq!(mutex.unlock(), Err(Error::InvalidArgument("destroyed object")));
        assert!(mutex.destroy().is_err());
    }

    #[test]
    fn static_mutex_binds_on_first_lock() {
        static LOCK: Mutex = Mutex::new_static(MutexKind::ErrorCheck);
        static UNUSED: Mutex = Mutex::new_static(MutexKind::Normal);

        assert_eq!(
            UNUSED.unlock(),
            Err(Error::InvalidArgument("uninitialized object"))
        );
        assert!(UNUSED.id().is_none());

        LOCK.lock().unwrap();
        assert!(LOCK.id().is_some());
        assert_eq!(LOCK.lock(), Err(Error::WouldDeadlock));
        LOCK.unlock().unwrap();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let rt = runtime();
        let mutex = Mutex::new(&rt, MutexKind::Normal);
        {
            let guard = mutex.guard().unwrap();
            assert!(guard.mutex().is_locked());
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn contention_borrows_and_returns_semaphores() {
        let rt = runtime();
        let mutex = Arc::new(Mutex::new(&rt, MutexKind::Normal));
        mutex.lock().unwrap();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || {
                mutex.lock().unwrap();
                mutex.unlock().unwrap();
            })
        };
        while mutex.waiters() == 0 {
            std::thread::yield_now();
        }
        assert_eq!(rt.pool_stats().checked_out, 2);

        mutex.unlock().unwrap();
        waiter.join().unwrap();
        assert_eq!(mutex.owner(), Owner::Unowned);
        assert_eq!(rt.pool_stats().checked_out, 0);
    }
}
