//! Condition variables.
//!
//! A condition variable borrows one pool semaphore while it has waiters.
//! Every wake-up is a *directed* post to the chosen waiter's kernel thread, so
//! a token can never be consumed by a thread it was not meant for and a
//! signal issued after the waiter released its mutex is banked until the
//! waiter gets to its wait. Waiters are marked `signalled` under the
//! condition variable's spinlock before the post; a waiter whose timeout
//! races a signal sees the mark and collects the token instead of leaving it
//! behind.
//!
//! While waiters exist the condition variable is associated with exactly one
//! mutex. The association is recorded in the runtime's table so the mutex
//! cannot be destroyed underneath a wait.

use core::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::trace;
use uthr_kernel::{KernelThreadId, SemHandle};

use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::object::{ObjectId, SigState, Signature, SIG_COND};
use crate::pool::{self, SemLease};
use crate::runtime::Runtime;
use crate::spinlock::SpinLock;
use crate::thread::{cancel, Blocked, ThreadId};
use crate::trace::TraceKind;

struct CondWaiter {
    thread: ThreadId,
    kernel: KernelThreadId,
    priority: i32,
    seq: u64,
    signalled: bool,
}

struct CondState {
    waiters: Vec<CondWaiter>,
    sem: Option<SemLease>,
    /// Mutex the current waiters share.
    mutex: Option<ObjectId>,
    /// Signal and broadcast calls between choosing waiters and posting.
    sigspending: u32,
    next_seq: u64,
}

#[derive(Clone, Copy)]
enum Wake {
    /// One waiter, preferring the hinted thread if it is waiting.
    One(Option<ThreadId>),
    All,
    /// Only this thread; used to interrupt a wait for cancellation.
    Exact(ThreadId),
}

pub(crate) struct CondCore {
    rt: Runtime,
    id: ObjectId,
    state: SpinLock<CondState>,
}

pub struct CondVar {
    sig: Signature,
    core: OnceLock<Arc<CondCore>>,
}

impl CondVar {
    pub fn new(rt: &Runtime) -> Self {
        let core = OnceLock::new();
        let _ = core.set(CondCore::new(rt));
        Self {
            sig: Signature::new_live(SIG_COND, "condition variable"),
            core,
        }
    }

    /// Static initializer. Binds to the runtime of the first mutex waited
    /// with.
    pub const fn new_static() -> Self {
        Self {
            sig: Signature::new_static(SIG_COND, "condition variable"),
            core: OnceLock::new(),
        }
    }

    /// `None` until a static condition variable is first waited on.
    pub fn id(&self) -> Option<ObjectId> {
        self.core.get().map(|core| core.id)
    }

    pub fn waiters(&self) -> usize {
        self.core
            .get()
            .map_or(0, |core| core.state.lock().waiters.len())
    }

    /// Releases `mutex`, waits for a signal, and re-acquires `mutex`.
    ///
    /// The caller must own `mutex`. A cancellation point on entry and after
    /// wake-up; when cancellation is acted on after wake-up the mutex is held
    /// again first.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_inner(mutex, None, true)
    }

    /// Like [`CondVar::wait`], giving up at `deadline` with `TimedOut`. The
    /// mutex is re-acquired on timeout too.
    pub fn wait_until(&self, mutex: &Mutex, deadline: Instant) -> Result<()> {
        self.wait_inner(mutex, Some(deadline), true)
    }

    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        self.wait_inner(mutex, deadline, true)
    }

    /// Wait that is not a cancellation point.
    pub(crate) fn wait_plain(&self, mutex: &Mutex, deadline: Option<Instant>) -> Result<()> {
        self.wait_inner(mutex, deadline, false)
    }

    /// Wakes one waiter. A no-op without waiters.
    pub fn signal(&self) -> Result<()> {
        self.wake(Wake::One(None))
    }

    /// Wakes `thread` if it is waiting here, otherwise any one waiter.
    pub fn signal_to(&self, thread: ThreadId) -> Result<()> {
        self.wake(Wake::One(Some(thread)))
    }

    pub fn broadcast(&self) -> Result<()> {
        self.wake(Wake::All)
    }

    /// Fails with `Busy` while threads wait or a signal is being delivered.
    pub fn destroy(&self) -> Result<()> {
        let Some(core) = self.core.get() else {
            self.sig.state()?;
            self.sig.retire();
            return Ok(());
        };
        let state = core.state.lock();
        if self.sig.state()? == SigState::Static {
            self.sig.retire();
            return Ok(());
        }
        if !state.waiters.is_empty() || state.sigspending > 0 {
            return Err(Error::Busy);
        }
        self.sig.retire();
        Ok(())
    }

    /// Waiters present or signals still in flight.
    pub(crate) fn is_busy(&self) -> bool {
        self.core.get().is_some_and(|core| {
            let state = core.state.lock();
            !state.waiters.is_empty() || state.sigspending > 0
        })
    }

    fn wake(&self, wake: Wake) -> Result<()> {
        if self.sig.state()? == SigState::Static {
            // Nobody has waited yet.
            return Ok(());
        }
        match self.core.get() {
            Some(core) => core.wake(&self.sig, wake),
            None => Ok(()),
        }
    }

    /// Live core, binding a static condition variable to `rt` first.
    fn bind(&self, rt: &Runtime) -> Result<&Arc<CondCore>> {
        if self.sig.state()? == SigState::Static {
            self.core.get_or_init(|| CondCore::new(rt));
            self.sig.promote();
        }
        self.sig.check_live()?;
        let core = self
            .core
            .get()
            .ok_or(Error::InvalidArgument("uninitialized object"))?;
        if !core.rt.same_as(rt) {
            return Err(Error::InvalidArgument("mutex belongs to another runtime"));
        }
        Ok(core)
    }

    fn wait_inner(&self, mutex: &Mutex, deadline: Option<Instant>, cancelable: bool) -> Result<()> {
        let binding = mutex.binding()?;
        let core = self.bind(&binding.rt)?;
        let rt = &core.rt;
        let mutex_id = binding.id;
        let me = rt.current_record();
        if cancelable {
            cancel::point(&me);
        }
        if !mutex.is_owned_by(me.id) {
            return Err(Error::NotOwner);
        }
        let budget = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(Error::TimedOut);
                }
                Some(deadline - now)
            }
            None => None,
        };

        let (sem, waiters) = {
            let mut state = core.state.lock();
            self.sig.check_live()?;
            if !state.waiters.is_empty() && state.mutex != Some(mutex_id) {
                return Err(Error::InvalidArgument(
                    "condition variable is in use with another mutex",
                ));
            }
            let sem = match state.sem.as_ref() {
                Some(lease) => lease.handle(),
                None => {
                    let lease = rt.pool().checkout()?;
                    let sem = lease.handle();
                    state.sem = Some(lease);
                    sem
                }
            };
            if state.waiters.is_empty() {
                state.mutex = Some(mutex_id);
                rt.assoc().link(mutex_id, core.id);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(CondWaiter {
                thread: me.id,
                kernel: rt.kern().current(),
                priority: me.priority(),
                seq,
                signalled: false,
            });
            (sem, state.waiters.len())
        };
        rt.emit(TraceKind::CondWait, Some(core.id), Some(me.id), waiters as u64);

        if cancelable {
            me.set_blocked(Blocked::Cond(Arc::clone(core)));
            if cancel::actionable(&me) {
                core.interrupt(me.id);
            }
        }

        let saved = match mutex.release_for_wait(me.id) {
            Ok(saved) => saved,
            Err(err) => {
                core.leave(me.id, mutex_id);
                if cancelable {
                    me.set_blocked(Blocked::Nothing);
                }
                return Err(err);
            }
        };

        let woke = pool::wait(rt.kern(), sem, budget);
        let timed_out = !woke && !core.collect_signal(me.id, sem);
        core.leave(me.id, mutex_id);
        if cancelable {
            me.set_blocked(Blocked::Nothing);
        }

        mutex.reacquire(me.id, saved)?;
        if cancelable {
            cancel::point(&me);
        }
        if timed_out {
            trace!("cond {}: {} timed out", core.id, me.id);
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }
}

impl CondCore {
    fn new(rt: &Runtime) -> Arc<Self> {
        Arc::new(Self {
            rt: rt.clone(),
            id: ObjectId::next(),
            state: SpinLock::new(CondState {
                waiters: Vec::new(),
                sem: None,
                mutex: None,
                sigspending: 0,
                next_seq: 0,
            }),
        })
    }

    /// Wakes `thread` out of a wait here so it can act on a cancel.
    pub(crate) fn interrupt(&self, thread: ThreadId) {
        let _ = self.post(Wake::Exact(thread));
    }

    fn wake(&self, sig: &Signature, wake: Wake) -> Result<()> {
        {
            let state = self.state.lock();
            sig.check_live()?;
            if state.waiters.is_empty() {
                return Ok(());
            }
        }
        let woken = self.post(wake);
        if woken > 0 {
            let kind = match wake {
                Wake::All => TraceKind::CondBroadcast,
                _ => TraceKind::CondSignal,
            };
            self.rt.emit(kind, Some(self.id), None, woken as u64);
        }
        Ok(())
    }

    /// Marks the chosen waiters and posts to each. Returns how many.
    fn post(&self, wake: Wake) -> usize {
        let (sem, targets) = {
            let mut state = self.state.lock();
            let Some(sem) = state.sem.as_ref().map(SemLease::handle) else {
                return 0;
            };
            let targets = pick(&mut state.waiters, wake);
            if targets.is_empty() {
                return 0;
            }
            state.sigspending += 1;
            (sem, targets)
        };

        for &kernel in &targets {
            pool::post_to(self.rt.kern(), sem, kernel);
        }

        let lease = {
            let mut state = self.state.lock();
            state.sigspending -= 1;
            if state.waiters.is_empty() && state.sigspending == 0 {
                state.sem.take()
            } else {
                None
            }
        };
        drop(lease);
        targets.len()
    }

    /// After a timeout: if the waiter was chosen anyway, waits for the token
    /// that is on its way and reports the wait as woken.
    fn collect_signal(&self, thread: ThreadId, sem: SemHandle) -> bool {
        let signalled = self
            .state
            .lock()
            .waiters
            .iter()
            .any(|w| w.thread == thread && w.signalled);
        if signalled {
            pool::wait(self.rt.kern(), sem, None);
        }
        signalled
    }

    /// Removes the waiter entry. The last one out drops the association and,
    /// unless a signal is still being posted, the semaphore.
    fn leave(&self, thread: ThreadId, mutex: ObjectId) {
        let lease = {
            let mut state = self.state.lock();
            state.waiters.retain(|w| w.thread != thread);
            if !state.waiters.is_empty() {
                return;
            }
            state.mutex = None;
            self.rt.assoc().unlink(mutex, self.id);
            if state.sigspending == 0 {
                state.sem.take()
            } else {
                None
            }
        };
        drop(lease);
    }
}

/// Marks and returns the kernel threads to post to.
fn pick(waiters: &mut [CondWaiter], wake: Wake) -> Vec<KernelThreadId> {
    let mut chosen = Vec::new();
    match wake {
        Wake::All => {
            for waiter in waiters.iter_mut().filter(|w| !w.signalled) {
                waiter.signalled = true;
                chosen.push(waiter.kernel);
            }
        }
        Wake::Exact(thread) => {
            if let Some(waiter) = waiters
                .iter_mut()
                .find(|w| w.thread == thread && !w.signalled)
            {
                waiter.signalled = true;
                chosen.push(waiter.kernel);
            }
        }
        Wake::One(hint) => {
            let hinted = hint.and_then(|thread| {
                waiters
                    .iter()
                    .position(|w| w.thread == thread && !w.signalled)
            });
            let index = hinted.or_else(|| {
                waiters
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| !w.signalled)
                    .max_by(|(_, a), (_, b)| {
                        a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq))
                    })
                    .map(|(index, _)| index)
            });
            if let Some(index) = index {
                waiters[index].signalled = true;
                chosen.push(waiters[index].kernel);
            }
        }
    }
    chosen
}

impl fmt::Debug for CondVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("id", &self.id())
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MutexKind;

    fn waiter(priority: i32, seq: u64) -> CondWaiter {
        CondWaiter {
            thread: ThreadId::next(),
            kernel: KernelThreadId(seq + 100),
            priority,
            seq,
            signalled: false,
        }
    }

    #[test]
    fn undirected_signal_prefers_priority_then_arrival() {
        let mut waiters = vec![waiter(0, 0), waiter(10, 1), waiter(10, 2)];
        assert_eq!(pick(&mut waiters, Wake::One(None)), vec![KernelThreadId(101)]);
        assert_eq!(pick(&mut waiters, Wake::One(None)), vec![KernelThreadId(102)]);
        assert_eq!(pick(&mut waiters, Wake::One(None)), vec![KernelThreadId(100)]);
        assert!(pick(&mut waiters, Wake::One(None)).is_empty());
    }

    #[test]
    fn hint_wins_when_waiting() {
        let mut waiters = vec![waiter(5, 0), waiter(0, 1)];
        let hinted = waiters[1].thread;
        assert_eq!(
            pick(&mut waiters, Wake::One(Some(hinted))),
            vec![KernelThreadId(101)]
        );
        // Already signalled: falls back to the best remaining waiter.
        assert_eq!(
            pick(&mut waiters, Wake::One(Some(hinted))),
            vec![KernelThreadId(100)]
        );
    }

    #[test]
    fn broadcast_marks_every_unsignalled_waiter() {
        let mut waiters = vec![waiter(0, 0), waiter(0, 1), waiter(0, 2)];
        waiters[1].signalled = true;
        assert_eq!(
            pick(&mut waiters, Wake::All),
            vec![KernelThreadId(100), KernelThreadId(102)]
        );
        assert!(waiters.iter().all(|w| w.signalled));
    }

    #[test]
    fn signal_without_waiters_takes_nothing_from_the_pool() {
        let rt = Runtime::builder().build().unwrap();
        let cond = CondVar::new(&rt);
        cond.signal().unwrap();
        cond.broadcast().unwrap();
        assert_eq!(rt.pool_stats().capacity, 0);
    }

    #[test]
    fn wait_requires_ownership() {
        let rt = Runtime::builder().build().unwrap();
        let mutex = Mutex::new(&rt, MutexKind::Normal);
        let cond = CondVar::new(&rt);
        assert_eq!(cond.wait(&mutex), Err(Error::NotOwner));
    }

    #[test]
    fn expired_deadline_times_out_without_blocking() {
        let rt = Runtime::builder().build().unwrap();
        let mutex = Mutex::new(&rt, MutexKind::Normal);
        let cond = CondVar::new(&rt);
        mutex.lock().unwrap();
        assert_eq!(
            cond.wait_until(&mutex, Instant::now()),
            Err(Error::TimedOut)
        );
        assert!(mutex.is_owned_by(rt.current_record().id));
        assert_eq!(rt.pool_stats().checked_out, 0);
        mutex.unlock().unwrap();
    }

    #[test]
    fn timed_wait_reacquires_the_mutex() {
        let rt = Runtime::builder().build().unwrap();
        let mutex = Mutex::new(&rt, MutexKind::Recursive);
        let cond = CondVar::new(&rt);
        mutex.lock().unwrap();
        mutex.lock().unwrap();
        assert_eq!(
            cond.wait_timeout(&mutex, Duration::from_millis(20)),
            Err(Error::TimedOut)
        );
        // Recursion depth survives the wait.
        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
        assert_eq!(mutex.unlock(), Err(Error::NotOwner));
        assert_eq!(cond.waiters(), 0);
        assert_eq!(rt.pool_stats().checked_out, 0);
    }

    #[test]
    fn other_runtime_mutex_is_rejected() {
        let a = Runtime::builder().build().unwrap();
        let b = Runtime::builder().build().unwrap();
        let mutex = Mutex::new(&b, MutexKind::Normal);
        let cond = CondVar::new(&a);
        mutex.lock().unwrap();
        assert_eq!(
            cond.wait_timeout(&mutex, Duration::from_millis(1)),
            Err(Error::InvalidArgument("mutex belongs to another runtime"))
        );
        mutex.unlock().unwrap();
    }

    #[test]
    fn destroyed_condvar_rejects_use() {
        let rt = Runtime::builder().build().unwrap();
        let cond = CondVar::new(&rt);
        cond.destroy().unwrap();
        assert_eq!(cond.signal(), Err(Error::InvalidArgument("destroyed object")));
    }
}
