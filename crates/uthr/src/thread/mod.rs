//! Thread lifecycle: creation, exit, join, detach and reclamation.
//!
//! Each runtime-created thread owns a kernel thread and a stack region. Both
//! are reclaimed exactly once, by whichever party performs the single
//! `Exited -> Reaped` transition of the record's [`JoinState`]:
//!
//! - a joiner, after the thread has exited;
//! - `detach()` on a thread that has already exited;
//! - the runtime's reclamation queue, for a thread that exits while detached.
//!
//! The transition happens under the record's lifecycle spinlock; kernel calls
//! are made only after it is released.

use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use uthr_kernel::{Entry, Kernel, KernelThread, KernelThreadId, SchedParam, StackRegion};

use crate::condvar::CondCore;
use crate::error::{Error, Result};
use crate::pool::{self, SemLease};
use crate::runtime::Runtime;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::trace::TraceKind;
use crate::tsd::TsdSlot;

pub(crate) mod cancel;

pub use cancel::{CancelState, CancelType};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

/// Runtime identity of a thread. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    pub(crate) fn next() -> Self {
        ThreadId(NEXT_THREAD.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Joinable,
    Detached,
    /// Finished; waiting to be joined.
    Exited,
    /// Kernel thread and stack handed back.
    Reaped,
}

/// How a thread ended.
pub enum ThreadExit {
    /// Returned from its function or called [`Runtime::exit`].
    Value(Box<dyn Any + Send>),
    Canceled,
    /// Its function panicked; carries the panic payload.
    Panicked(Box<dyn Any + Send>),
}

impl ThreadExit {
    /// Downcasts a [`ThreadExit::Value`].
    pub fn value<T: 'static>(self) -> Option<T> {
        match self {
            ThreadExit::Value(value) => value.downcast::<T>().ok().map(|v| *v),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ThreadExit::Canceled)
    }

    pub fn is_panicked(&self) -> bool {
        matches!(self, ThreadExit::Panicked(_))
    }
}

impl fmt::Debug for ThreadExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadExit::Value(_) => f.write_str("Value(..)"),
            ThreadExit::Canceled => f.write_str("Canceled"),
            ThreadExit::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// What a thread is blocked in, so `cancel` can wake it.
#[derive(Clone, Default)]
pub(crate) enum Blocked {
    #[default]
    Nothing,
    Cond(Arc<CondCore>),
    Join(Arc<ThreadRecord>),
}

/// Kernel resources of a finished thread awaiting reclamation.
pub(crate) struct Corpse {
    pub(crate) thread: ThreadId,
    pub(crate) kernel: Option<KernelThread>,
    pub(crate) stack: Option<StackRegion>,
    pub(crate) death: Option<SemLease>,
}

pub(crate) struct Lifecycle {
    pub(crate) join: JoinState,
    joiner: Option<(ThreadId, KernelThreadId)>,
    exit: Option<ThreadExit>,
    /// Created only once somebody actually joins.
    death: Option<SemLease>,
    /// Posts to `death` in flight; the lease must not be drained or returned
    /// while non-zero.
    posting: u32,
    kernel: Option<KernelThread>,
    stack: Option<StackRegion>,
}

impl Lifecycle {
    fn take_corpse(&mut self, thread: ThreadId) -> Corpse {
        Corpse {
            thread,
            kernel: self.kernel.take(),
            stack: self.stack.take(),
            death: self.death.take(),
        }
    }
}

pub(crate) type CleanupHandler = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ThreadRecord {
    pub(crate) id: ThreadId,
    name: Option<String>,
    /// Not created by the runtime; never joinable.
    pub(crate) adopted: bool,
    kernel_id: SpinLock<Option<KernelThreadId>>,
    sched: SpinLock<SchedParam>,
    pub(crate) cancel: AtomicU8,
    pub(crate) blocked: SpinLock<Blocked>,
    pub(crate) cleanup: SpinLock<Vec<CleanupHandler>>,
    pub(crate) tsd: Box<[TsdSlot]>,
    life: SpinLock<Lifecycle>,
    /// Raw id of the thread this one is joining, 0 when none.
    joining: AtomicU64,
}

impl ThreadRecord {
    fn new(
        id: ThreadId,
        name: Option<String>,
        sched: SchedParam,
        keys: usize,
        join: JoinState,
        adopted: bool,
    ) -> Self {
        Self {
            id,
            name,
            adopted,
            kernel_id: SpinLock::new(None),
            sched: SpinLock::new(sched),
            cancel: AtomicU8::new(0),
            blocked: SpinLock::new(Blocked::Nothing),
            cleanup: SpinLock::new(Vec::new()),
            tsd: (0..keys).map(|_| TsdSlot::default()).collect(),
            life: SpinLock::new(Lifecycle {
                join,
                joiner: None,
                exit: None,
                death: None,
                posting: 0,
                kernel: None,
                stack: None,
            }),
            joining: AtomicU64::new(0),
        }
    }

    pub(crate) fn new_adopted(id: ThreadId, kernel_id: KernelThreadId, keys: usize) -> Self {
        let record = Self::new(id, None, SchedParam::default(), keys, JoinState::Detached, true);
        *record.kernel_id.lock() = Some(kernel_id);
        record
    }

    pub(crate) fn priority(&self) -> i32 {
        self.sched.lock().priority
    }

    pub(crate) fn join_state(&self) -> JoinState {
        self.life.lock().join
    }

    pub(crate) fn set_blocked(&self, blocked: Blocked) {
        *self.blocked.lock() = blocked;
    }

    /// Posts a directed token to `joiner` if it is still waiting on this
    /// thread's death.
    fn wake_joiner(&self, kernel: &dyn Kernel, joiner: ThreadId) {
        let target = {
            let mut life = self.life.lock();
            let death = life.death.as_ref().map(SemLease::handle);
            match (life.joiner, death) {
                (Some((waiting, kernel_id)), Some(sem))
                    if waiting == joiner && life.join != JoinState::Exited =>
                {
                    life.posting += 1;
                    (sem, kernel_id)
                }
                _ => return,
            }
        };
        pool::post_to(kernel, target.0, target.1);
        self.life.lock().posting -= 1;
    }

    /// Locks the lifecycle once no post to `death` is in flight.
    fn settled_life(&self, kernel: &dyn Kernel) -> SpinLockGuard<'_, Lifecycle> {
        loop {
            let life = self.life.lock();
            if life.posting == 0 {
                return life;
            }
            drop(life);
            kernel.yield_now();
        }
    }
}

/// Creation attributes for [`Runtime::spawn_with`].
#[derive(Debug, Clone, Default)]
pub struct ThreadAttr {
    name: Option<String>,
    stack_size: Option<usize>,
    guard_size: Option<usize>,
    detached: bool,
    sched: Option<SchedParam>,
}

impl ThreadAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Requested usable stack, rounded up to the kernel page size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn guard_size(mut self, bytes: usize) -> Self {
        self.guard_size = Some(bytes);
        self
    }

    /// Starts the thread detached: nobody may join it.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Applied while the thread is still suspended.
    pub fn sched(mut self, param: SchedParam) -> Self {
        self.sched = Some(param);
        self
    }
}

/// Handle to a thread. Cloning does not affect the thread.
#[derive(Clone)]
pub struct Thread {
    rt: Runtime,
    record: Arc<ThreadRecord>,
}

impl Thread {
    pub(crate) fn new(rt: Runtime, record: Arc<ThreadRecord>) -> Self {
        Self { rt, record }
    }

    pub fn id(&self) -> ThreadId {
        self.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn join_state(&self) -> JoinState {
        self.record.join_state()
    }

    /// The thread this one is currently blocked joining, if any.
    pub fn joining(&self) -> Option<ThreadId> {
        match self.record.joining.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(ThreadId(raw)),
        }
    }

    /// The thread registered as this one's joiner, if any.
    pub fn joined_by(&self) -> Option<ThreadId> {
        self.record.life.lock().joiner.map(|(thread, _)| thread)
    }

    pub fn sched_param(&self) -> SchedParam {
        *self.record.sched.lock()
    }

    pub fn set_sched_param(&self, param: SchedParam) -> Result<()> {
        param.validate()?;
        if !self.record.adopted {
            if self.join_state() == JoinState::Reaped {
                return Err(Error::InvalidState("thread already reclaimed"));
            }
            if let Some(kernel_id) = *self.record.kernel_id.lock() {
                self.rt.kernel().set_sched(kernel_id, param)?;
            }
        }
        *self.record.sched.lock() = param;
        Ok(())
    }

    /// Waits for the thread to finish and reclaims its kernel resources.
    ///
    /// The exit value is delivered to exactly one caller. Joining oneself, or
    /// a thread that is joining the caller, is `WouldDeadlock`.
    pub fn join(&self) -> Result<ThreadExit> {
        let rt = &self.rt;
        let target = &self.record;
        let me = rt.current_record();
        if me.id == target.id {
            return Err(Error::WouldDeadlock);
        }
        if target.adopted {
            return Err(Error::InvalidState("thread was not created by this runtime"));
        }

        let _joining = JoiningMark::set(&me, target.id);
        if target.joining.load(Ordering::SeqCst) == me.id.0 {
            return Err(Error::WouldDeadlock);
        }

        rt.reap_detached();
        let kernel = rt.kern();

        let sem = {
            let mut life = target.life.lock();
            let state = life.join;
            match state {
                JoinState::Detached => return Err(Error::InvalidState("thread is detached")),
                JoinState::Reaped => return Err(Error::InvalidState("thread already joined")),
                _ if life.joiner.is_some() => {
                    return Err(Error::InvalidState("thread already has a joiner"))
                }
                JoinState::Exited => return Ok(rt.reap_exited(target, life)),
                JoinState::Joinable => {}
            }
            let lease = match life.death.take() {
                Some(lease) => lease,
                None => rt.pool().checkout()?,
            };
            let sem = lease.handle();
            life.death = Some(lease);
            life.joiner = Some((me.id, kernel.current()));
            sem
        };

        me.set_blocked(Blocked::Join(Arc::clone(target)));
        let canceled = loop {
            if target.join_state() == JoinState::Exited {
                break false;
            }
            if cancel::actionable(&me) {
                break true;
            }
            pool::wait(kernel, sem, None);
        };
        me.set_blocked(Blocked::Nothing);

        let mut life = target.settled_life(kernel);
        if canceled && life.join != JoinState::Exited {
            life.joiner = None;
            drop(life);
            pool::drain(kernel, sem);
            cancel::act(&me);
        }
        Ok(rt.reap_exited(target, life))
    }

    /// Marks the thread detached, or reclaims it now if it already exited.
    pub fn detach(&self) -> Result<()> {
        if self.record.adopted {
            return Err(Error::InvalidState("thread was not created by this runtime"));
        }
        let mut life = self.record.life.lock();
        let state = life.join;
        match state {
            JoinState::Joinable | JoinState::Exited if life.joiner.is_some() => {
                Err(Error::InvalidState("thread is being joined"))
            }
            JoinState::Joinable => {
                life.join = JoinState::Detached;
                Ok(())
            }
            JoinState::Exited => {
                drop(self.rt.reap_exited(&self.record, life));
                Ok(())
            }
            JoinState::Detached => Err(Error::InvalidState("thread already detached")),
            JoinState::Reaped => Err(Error::InvalidState("thread already joined")),
        }
    }

    /// Requests cancellation. Acted on at the target's next cancellation
    /// point while its cancel state is enabled.
    pub fn cancel(&self) -> Result<()> {
        let target = &self.record;
        if target.adopted {
            return Err(Error::InvalidState("thread was not created by this runtime"));
        }
        if target.join_state() == JoinState::Reaped {
            return Err(Error::InvalidState("thread already reclaimed"));
        }
        if !cancel::request(target) {
            return Ok(());
        }
        let blocked = target.blocked.lock().clone();
        match blocked {
            Blocked::Cond(core) => core.interrupt(target.id),
            Blocked::Join(joined) => joined.wake_joiner(self.rt.kern(), target.id),
            Blocked::Nothing => {}
        }
        Ok(())
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("state", &self.join_state())
            .finish()
    }
}

struct JoiningMark<'a> {
    record: &'a ThreadRecord,
}

impl<'a> JoiningMark<'a> {
    fn set(record: &'a ThreadRecord, target: ThreadId) -> Self {
        record.joining.store(target.0, Ordering::SeqCst);
        Self { record }
    }
}

impl Drop for JoiningMark<'_> {
    fn drop(&mut self) {
        self.record.joining.store(0, Ordering::SeqCst);
    }
}

fn trampoline<F, T>(rt: Runtime, record: Arc<ThreadRecord>, f: F)
where
    F: FnOnce() -> T,
    T: Send + 'static,
{
    rt.install(Arc::clone(&record));
    let exit = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => ThreadExit::Value(Box::new(value)),
        Err(payload) => cancel::classify(record.id, payload),
    };
    rt.finish_thread(&record, exit);
}

impl Runtime {
    /// Spawns a joinable thread with default attributes.
    pub fn spawn<F, T>(&self, f: F) -> Result<Thread>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(ThreadAttr::default(), f)
    }

    /// Spawns a thread. The kernel thread is created suspended, configured,
    /// and only then released.
    pub fn spawn_with<F, T>(&self, attr: ThreadAttr, f: F) -> Result<Thread>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.reap_detached();

        let config = self.config();
        let usable = attr.stack_size.unwrap_or(config.default_stack_size);
        if usable < config.min_stack_size {
            return Err(Error::InvalidArgument("stack size below minimum"));
        }
        let guard = attr.guard_size.unwrap_or(config.guard_size);
        if let Some(param) = attr.sched {
            param.validate()?;
        }

        self.reserve_thread()?;
        let kernel = Arc::clone(self.kernel());
        let stack = match kernel.map_stack(usable, guard) {
            Ok(stack) => stack,
            Err(err) => {
                self.release_thread();
                return Err(err.into());
            }
        };

        let id = ThreadId::next();
        let name = attr
            .name
            .unwrap_or_else(|| format!("{}-{}", config.name, id.0));
        let join = if attr.detached {
            JoinState::Detached
        } else {
            JoinState::Joinable
        };
        let record = Arc::new(ThreadRecord::new(
            id,
            Some(name.clone()),
            attr.sched.unwrap_or_default(),
            config.max_keys,
            join,
            false,
        ));
        self.register(Arc::clone(&record));

        let entry: Entry = {
            let rt = self.clone();
            let record = Arc::clone(&record);
            Box::new(move || trampoline(rt, record, f))
        };
        let handle = match kernel.spawn(&name, &stack, true, entry) {
            Ok(handle) => handle,
            Err(err) => {
                self.deregister(id);
                if let Err(unmap) = kernel.unmap_stack(stack) {
                    warn!("{id}: unmap after failed spawn: {unmap}");
                }
                self.release_thread();
                return Err(err.into());
            }
        };

        let kernel_id = handle.id();
        *record.kernel_id.lock() = Some(kernel_id);
        {
            let mut life = record.life.lock();
            life.kernel = Some(handle);
            life.stack = Some(stack);
        }

        let started = match attr.sched {
            Some(param) => kernel.set_sched(kernel_id, param),
            None => Ok(()),
        }
        .and_then(|()| kernel.resume(kernel_id));
        if let Err(err) = started {
            let corpse = {
                let mut life = record.life.lock();
                life.join = JoinState::Reaped;
                life.take_corpse(id)
            };
            self.deregister(id);
            if let Err(reclaim) = self.reclaim(corpse) {
                warn!("{id}: reclaim after failed start: {reclaim}");
            }
            return Err(err.into());
        }

        debug!("spawned {id} ({name}) on {kernel_id}");
        self.emit(TraceKind::ThreadCreate, None, Some(id), 0);
        Ok(Thread::new(self.clone(), record))
    }

    /// Runs at the end of every runtime-created thread, on that thread.
    fn finish_thread(&self, record: &Arc<ThreadRecord>, exit: ThreadExit) {
        cancel::begin_exit(record);
        cancel::run_cleanup(record);
        self.run_destructors(record);
        self.uninstall(record.id);
        self.emit(TraceKind::ThreadExit, None, Some(record.id), 0);

        let mut corpse = None;
        let mut post = None;
        {
            let mut life = record.life.lock();
            match life.join {
                JoinState::Detached => {
                    life.join = JoinState::Reaped;
                    corpse = Some(life.take_corpse(record.id));
                }
                _ => {
                    life.exit = Some(exit);
                    life.join = JoinState::Exited;
                    let death = life.death.as_ref().map(SemLease::handle);
                    if let (Some((_, joiner)), Some(sem)) = (life.joiner, death) {
                        post = Some((sem, joiner));
                        life.posting += 1;
                    }
                }
            }
        }

        if let Some((sem, joiner)) = post {
            pool::post_to(self.kern(), sem, joiner);
            record.life.lock().posting -= 1;
        }
        if let Some(corpse) = corpse {
            self.deregister(record.id);
            self.bury(corpse);
        }
    }

    /// Performs the `Exited -> Reaped` transition and reclaims everything.
    fn reap_exited(
        &self,
        target: &ThreadRecord,
        mut life: SpinLockGuard<'_, Lifecycle>,
    ) -> ThreadExit {
        let exit = life.exit.take();
        life.join = JoinState::Reaped;
        life.joiner = None;
        let corpse = life.take_corpse(target.id);
        drop(life);

        if let Some(death) = corpse.death.as_ref() {
            pool::drain(self.kern(), death.handle());
        }
        self.deregister(target.id);
        if let Err(err) = self.reclaim(corpse) {
            warn!("{}: reclaim failed: {err}", target.id);
        }
        exit.unwrap_or(ThreadExit::Canceled)
    }
}
