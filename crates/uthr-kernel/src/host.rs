//! Kernel port hosted on the standard library.
//!
//! Threads are `std::thread` workers parked behind a start gate so they can be
//! created suspended. Semaphores are `parking_lot` mutex/condvar pairs kept in
//! a handle table. The OS places the real stack and its guard page, so stack
//! "mapping" here is a page-rounded reservation against a byte budget; that is
//! enough to observe that every region is released exactly once.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    round_to_page, Entry, Kernel, KernelError, KernelResult, KernelThread, KernelThreadId,
    SchedParam, SemHandle, StackRegion,
};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<KernelThreadId>> = const { Cell::new(None) };
}

fn fresh_thread_id() -> KernelThreadId {
    KernelThreadId(NEXT_THREAD.fetch_add(1, Ordering::Relaxed))
}

fn current_thread_id() -> KernelThreadId {
    CURRENT
        .try_with(|cell| match cell.get() {
            Some(id) => id,
            None => {
                let id = fresh_thread_id();
                cell.set(Some(id));
                id
            }
        })
        .unwrap_or_else(|_| fresh_thread_id())
}

/// Sizing for the host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub page_size: usize,
    pub max_threads: usize,
    pub max_semaphores: usize,
    pub max_stack_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_threads: 4096,
            max_semaphores: 65_536,
            max_stack_bytes: 16 << 30,
        }
    }
}

impl HostConfig {
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }
}

/// Builder for [`HostConfig`].
#[derive(Debug, Clone, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Sets the page size used for stack rounding.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.config.page_size = bytes;
        self
    }

    /// Sets the number of kernel threads that may exist at once.
    pub fn max_threads(mut self, max: usize) -> Self {
        self.config.max_threads = max;
        self
    }

    /// Sets the number of live semaphores before creation fails.
    pub fn max_semaphores(mut self, max: usize) -> Self {
        self.config.max_semaphores = max;
        self
    }

    /// Sets the stack reservation budget in bytes, guard areas included.
    pub fn max_stack_bytes(mut self, max: usize) -> Self {
        self.config.max_stack_bytes = max;
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }
}

/// Point-in-time resource accounting for a [`HostKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStats {
    pub live_threads: usize,
    pub live_semaphores: usize,
    pub mapped_stack_bytes: usize,
    pub live_stacks: usize,
    pub threads_spawned: u64,
    pub threads_reclaimed: u64,
    pub semaphores_created: u64,
    pub semaphores_destroyed: u64,
    pub stacks_mapped: u64,
    pub stacks_unmapped: u64,
    pub yields: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Cancelled,
}

struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Gate {
    fn new(state: GateState) -> Self {
        Self {
            state: Mutex::new(state),
            cv: Condvar::new(),
        }
    }

    /// Blocks while closed; `true` means the entry may run.
    fn pass(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Closed {
            self.cv.wait(&mut state);
        }
        *state == GateState::Open
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Closed {
            *state = GateState::Open;
            self.cv.notify_all();
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Closed {
            *state = GateState::Cancelled;
            self.cv.notify_all();
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.lock() == GateState::Closed
    }
}

struct ThreadSlot {
    gate: Arc<Gate>,
    join: JoinHandle<()>,
    sched: SchedParam,
}

#[derive(Default)]
struct ThreadTable {
    live: HashMap<KernelThreadId, ThreadSlot>,
    spawned: u64,
    reclaimed: u64,
}

#[derive(Default)]
struct SemState {
    posted: bool,
    directed: Vec<KernelThreadId>,
}

impl SemState {
    fn take_token(&mut self, me: KernelThreadId) -> bool {
        if let Some(pos) = self.directed.iter().position(|t| *t == me) {
            self.directed.swap_remove(pos);
            return true;
        }
        if self.posted {
            self.posted = false;
            return true;
        }
        false
    }
}

struct HostSem {
    name: String,
    state: Mutex<SemState>,
    cv: Condvar,
}

#[derive(Default)]
struct SemTable {
    next: u32,
    live: HashMap<u32, Arc<HostSem>>,
    created: u64,
    destroyed: u64,
}

#[derive(Default)]
struct StackTable {
    next: u64,
    live: HashMap<u64, usize>,
    mapped_bytes: usize,
    mapped: u64,
    unmapped: u64,
}

/// [`Kernel`] implementation on top of `std::thread`.
pub struct HostKernel {
    config: HostConfig,
    threads: Mutex<ThreadTable>,
    sems: Mutex<SemTable>,
    stacks: Mutex<StackTable>,
    yields: AtomicU64,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl HostKernel {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            threads: Mutex::new(ThreadTable::default()),
            sems: Mutex::new(SemTable::default()),
            stacks: Mutex::new(StackTable::default()),
            yields: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stats(&self) -> KernelStats {
        let threads = self.threads.lock();
        let sems = self.sems.lock();
        let stacks = self.stacks.lock();
        KernelStats {
            live_threads: threads.live.len(),
            live_semaphores: sems.live.len(),
            mapped_stack_bytes: stacks.mapped_bytes,
            live_stacks: stacks.live.len(),
            threads_spawned: threads.spawned,
            threads_reclaimed: threads.reclaimed,
            semaphores_created: sems.created,
            semaphores_destroyed: sems.destroyed,
            stacks_mapped: stacks.mapped,
            stacks_unmapped: stacks.unmapped,
            yields: self.yields.load(Ordering::Relaxed),
        }
    }

    /// Scheduling parameters last applied to a live thread.
    pub fn sched_of(&self, thread: KernelThreadId) -> Option<SchedParam> {
        self.threads.lock().live.get(&thread).map(|slot| slot.sched)
    }

    fn sem(&self, handle: SemHandle) -> KernelResult<Arc<HostSem>> {
        self.sems
            .lock()
            .live
            .get(&handle.0)
            .cloned()
            .ok_or(KernelError::BadHandle)
    }
}

impl Kernel for HostKernel {
    fn current(&self) -> KernelThreadId {
        current_thread_id()
    }

    fn spawn(
        &self,
        name: &str,
        stack: &StackRegion,
        suspended: bool,
        entry: Entry,
    ) -> KernelResult<KernelThread> {
        if !self.stacks.lock().live.contains_key(&stack.token()) {
            return Err(KernelError::BadHandle);
        }

        let mut threads = self.threads.lock();
        if threads.live.len() >= self.config.max_threads {
            return Err(KernelError::Exhausted("kernel threads"));
        }

        let id = fresh_thread_id();
        let gate = Arc::new(Gate::new(if suspended {
            GateState::Closed
        } else {
            GateState::Open
        }));
        let start = Arc::clone(&gate);
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .stack_size(stack.usable_size())
            .spawn(move || {
                let _ = CURRENT.try_with(|cell| cell.set(Some(id)));
                if start.pass() {
                    entry();
                }
            })
            .map_err(|err| KernelError::Spawn(err.to_string()))?;

        threads.live.insert(
            id,
            ThreadSlot {
                gate,
                join,
                sched: SchedParam::default(),
            },
        );
        threads.spawned += 1;
        debug!("host: spawned {id} ({name}), suspended={suspended}");
        Ok(KernelThread::new(id))
    }

    fn resume(&self, thread: KernelThreadId) -> KernelResult<()> {
        let gate = {
            let threads = self.threads.lock();
            let slot = threads.live.get(&thread).ok_or(KernelError::BadHandle)?;
            Arc::clone(&slot.gate)
        };
        gate.open();
        Ok(())
    }

    fn suspend(&self, thread: KernelThreadId) -> KernelResult<()> {
        let threads = self.threads.lock();
        let slot = threads.live.get(&thread).ok_or(KernelError::BadHandle)?;
        if slot.gate.is_closed() {
            Ok(())
        } else {
            Err(KernelError::Unsupported("suspending a running thread"))
        }
    }

    fn set_sched(&self, thread: KernelThreadId, param: SchedParam) -> KernelResult<()> {
        param.validate()?;
        let mut threads = self.threads.lock();
        let slot = threads
            .live
            .get_mut(&thread)
            .ok_or(KernelError::BadHandle)?;
        slot.sched = param;
        debug!("host: {thread} sched -> {param:?}");
        Ok(())
    }

    fn terminate(&self, thread: KernelThread) -> KernelResult<()> {
        let id = thread.id();
        let slot = {
            let mut threads = self.threads.lock();
            let slot = threads.live.remove(&id).ok_or(KernelError::BadHandle)?;
            threads.reclaimed += 1;
            slot
        };

        if id == current_thread_id() {
            // The OS thread is finishing on its own; dropping the handle detaches it.
            debug!("host: {id} reclaimed from its own context");
            return Ok(());
        }

        slot.gate.cancel();
        match slot.join.join() {
            Ok(()) => {
                trace!("host: reclaimed {id}");
                Ok(())
            }
            Err(_) => {
                warn!("host: {id} unwound past its entry point");
                Err(KernelError::Crashed)
            }
        }
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }

    fn sem_create(&self, name: &str) -> KernelResult<SemHandle> {
        let mut sems = self.sems.lock();
        if sems.live.len() >= self.config.max_semaphores {
            return Err(KernelError::Exhausted("kernel semaphores"));
        }
        sems.next = sems.next.wrapping_add(1);
        while sems.next == 0 || sems.live.contains_key(&sems.next) {
            sems.next = sems.next.wrapping_add(1);
        }
        let raw = sems.next;
        sems.live.insert(
            raw,
            Arc::new(HostSem {
                name: name.to_owned(),
                state: Mutex::new(SemState::default()),
                cv: Condvar::new(),
            }),
        );
        sems.created += 1;
        Ok(SemHandle(raw))
    }

    fn sem_destroy(&self, sem: SemHandle) -> KernelResult<()> {
        let mut sems = self.sems.lock();
        let removed = sems.live.remove(&sem.0).ok_or(KernelError::BadHandle)?;
        sems.destroyed += 1;
        trace!("host: destroyed {sem} ({})", removed.name);
        Ok(())
    }

    fn sem_wait(&self, sem: SemHandle, timeout: Option<Duration>) -> KernelResult<()> {
        let sem = self.sem(sem)?;
        let me = current_thread_id();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = sem.state.lock();
        loop {
            if state.take_token(me) {
                return Ok(());
            }
            match deadline {
                // An unrepresentable deadline waits forever.
                None => sem.cv.wait(&mut state),
                Some(deadline) => {
                    if sem.cv.wait_until(&mut state, deadline).timed_out() {
                        return if state.take_token(me) {
                            Ok(())
                        } else {
                            Err(KernelError::TimedOut)
                        };
                    }
                }
            }
        }
    }

    fn sem_post(&self, sem: SemHandle) -> KernelResult<()> {
        let sem = self.sem(sem)?;
        let mut state = sem.state.lock();
        state.posted = true;
        // Waiters for directed and anonymous tokens share the condvar.
        sem.cv.notify_all();
        Ok(())
    }

    fn sem_post_to(&self, sem: SemHandle, target: KernelThreadId) -> KernelResult<()> {
        let sem = self.sem(sem)?;
        let mut state = sem.state.lock();
        if !state.directed.contains(&target) {
            state.directed.push(target);
        }
        sem.cv.notify_all();
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn map_stack(&self, usable: usize, guard: usize) -> KernelResult<StackRegion> {
        if usable == 0 {
            return Err(KernelError::InvalidArgument("empty stack"));
        }
        let usable = round_to_page(usable, self.config.page_size);
        let guard = round_to_page(guard, self.config.page_size);
        let total = usable + guard;

        let mut stacks = self.stacks.lock();
        if stacks.mapped_bytes + total > self.config.max_stack_bytes {
            return Err(KernelError::Exhausted("stack memory"));
        }
        stacks.next += 1;
        let token = stacks.next;
        stacks.live.insert(token, total);
        stacks.mapped_bytes += total;
        stacks.mapped += 1;
        Ok(StackRegion::new(token, usable, guard))
    }

    fn unmap_stack(&self, stack: StackRegion) -> KernelResult<()> {
        let mut stacks = self.stacks.lock();
        let total = stacks
            .live
            .remove(&stack.token())
            .ok_or(KernelError::BadHandle)?;
        stacks.mapped_bytes -= total;
        stacks.unmapped += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = HostConfig::builder()
            .page_size(8192)
            .max_threads(4)
            .max_semaphores(8)
            .max_stack_bytes(1 << 20)
            .build();

        assert_eq!(config.page_size, 8192);
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.max_semaphores, 8);
        assert_eq!(config.max_stack_bytes, 1 << 20);
    }

    #[test]
    fn current_is_stable_per_thread() {
        let kernel = HostKernel::default();
        let a = kernel.current();
        assert_eq!(a, kernel.current());

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn sem_tokens_are_binary() {
        let kernel = HostKernel::default();
        let sem = kernel.sem_create("binary").unwrap();

        kernel.sem_post(sem).unwrap();
        kernel.sem_post(sem).unwrap();
        assert_eq!(kernel.sem_wait(sem, Some(Duration::ZERO)), Ok(()));
        assert_eq!(
            kernel.sem_wait(sem, Some(Duration::ZERO)),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn directed_token_ignores_other_threads() {
        let kernel = HostKernel::default();
        let sem = kernel.sem_create("directed").unwrap();
        let me = kernel.current();

        kernel.sem_post_to(sem, KernelThreadId(u64::MAX)).unwrap();
        assert_eq!(
            kernel.sem_wait(sem, Some(Duration::from_millis(5))),
            Err(KernelError::TimedOut)
        );

        kernel.sem_post_to(sem, me).unwrap();
        assert_eq!(kernel.sem_wait(sem, Some(Duration::ZERO)), Ok(()));
    }

    #[test]
    fn destroyed_semaphore_is_bad_handle() {
        let kernel = HostKernel::default();
        let sem = kernel.sem_create("gone").unwrap();
        kernel.sem_destroy(sem).unwrap();

        assert_eq!(kernel.sem_post(sem), Err(KernelError::BadHandle));
        assert_eq!(kernel.sem_destroy(sem), Err(KernelError::BadHandle));
    }

    #[test]
    fn semaphore_budget() {
        let kernel = HostKernel::new(HostConfig::builder().max_semaphores(2).build());
        kernel.sem_create("a").unwrap();
        kernel.sem_create("b").unwrap();
        assert_eq!(
            kernel.sem_create("c"),
            Err(KernelError::Exhausted("kernel semaphores"))
        );
    }

    #[test]
    fn stack_accounting_rounds_to_pages() {
        let kernel = HostKernel::default();
        let region = kernel.map_stack(5000, 1).unwrap();

        assert_eq!(region.usable_size(), 8192);
        assert_eq!(region.guard_size(), 4096);
        assert_eq!(kernel.stats().mapped_stack_bytes, 12288);

        kernel.unmap_stack(region).unwrap();
        let stats = kernel.stats();
        assert_eq!(stats.mapped_stack_bytes, 0);
        assert_eq!(stats.stacks_mapped, 1);
        assert_eq!(stats.stacks_unmapped, 1);
    }

    #[test]
    fn stack_budget_exhaustion() {
        let kernel = HostKernel::new(HostConfig::builder().max_stack_bytes(16384).build());
        let first = kernel.map_stack(8192, 4096).unwrap();
        assert_eq!(
            kernel.map_stack(8192, 4096).unwrap_err(),
            KernelError::Exhausted("stack memory")
        );
        kernel.unmap_stack(first).unwrap();
        assert!(kernel.map_stack(8192, 4096).is_ok());
    }

    #[test]
    fn yields_are_counted() {
        let kernel = HostKernel::default();
        kernel.yield_now();
        kernel.yield_now();
        assert_eq!(kernel.stats().yields, 2);
    }
}
