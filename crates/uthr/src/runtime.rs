//! The runtime context: everything that would otherwise be process-global.
//!
//! A [`Runtime`] owns the kernel port, the semaphore pool, the TSD key table,
//! the registry of live thread records, the condition-variable/mutex
//! association table, and the queue of detached threads awaiting
//! reclamation. Independent runtimes never share any of it, which is what
//! lets tests run side by side.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, warn};
use uthr_kernel::{HostKernel, Kernel};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::pool::{PoolStats, SemPool};
use crate::spinlock::{self, SpinLock};
use crate::thread::{cancel, Corpse, Thread, ThreadId, ThreadRecord};
use crate::trace::{self, TraceHook, TraceKind, TraceRecord};
use crate::tsd::KeyTable;

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// A thread's record in one runtime.
struct Installed {
    runtime: u64,
    record: Arc<ThreadRecord>,
    /// Set for adopted threads: deregister when the OS thread goes away.
    adopted_by: Option<Weak<RuntimeInner>>,
}

impl Installed {
    /// An adopted entry whose runtime has been dropped.
    fn is_orphaned(&self) -> bool {
        self.adopted_by
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
    }
}

impl Drop for Installed {
    fn drop(&mut self) {
        if let Some(inner) = self.adopted_by.take().and_then(|weak| weak.upgrade()) {
            inner.threads.lock().remove(&self.record.id);
        }
    }
}

thread_local! {
    static INSTALLED: RefCell<Vec<Installed>> = const { RefCell::new(Vec::new()) };
}

/// Mutex identity -> condition variables currently waiting with it.
#[derive(Default)]
pub(crate) struct AssocTable {
    links: SpinLock<HashMap<ObjectId, Vec<ObjectId>>>,
}

impl AssocTable {
    pub(crate) fn link(&self, mutex: ObjectId, cond: ObjectId) {
        let mut links = self.links.lock();
        let conds = links.entry(mutex).or_default();
        if !conds.contains(&cond) {
            conds.push(cond);
        }
    }

    pub(crate) fn unlink(&self, mutex: ObjectId, cond: ObjectId) {
        let mut links = self.links.lock();
        if let Some(conds) = links.get_mut(&mutex) {
            conds.retain(|c| *c != cond);
            if conds.is_empty() {
                links.remove(&mutex);
            }
        }
    }

    pub(crate) fn is_linked(&self, mutex: ObjectId) -> bool {
        self.links.lock().contains_key(&mutex)
    }
}

pub(crate) struct RuntimeInner {
    id: u64,
    config: RuntimeConfig,
    kernel: Arc<dyn Kernel>,
    pool: Arc<SemPool>,
    keys: KeyTable,
    threads: SpinLock<HashMap<ThreadId, Arc<ThreadRecord>>>,
    spawned: AtomicUsize,
    graveyard: SpinLock<Vec<Corpse>>,
    assoc: AssocTable,
    trace: Option<TraceHook>,
}

impl RuntimeInner {
    /// Hands a finished thread's kernel thread and stack back to the kernel.
    fn reclaim(&self, corpse: Corpse) -> Result<()> {
        let thread = corpse.thread;
        let mut result = Ok(());
        if let Some(handle) = corpse.kernel {
            result = self.kernel.terminate(handle).map_err(Error::from);
        }
        if let Some(stack) = corpse.stack {
            result = result.and(self.kernel.unmap_stack(stack).map_err(Error::from));
        }
        drop(corpse.death);
        self.spawned.fetch_sub(1, Ordering::AcqRel);
        trace::emit(
            self.trace.as_ref(),
            TraceRecord {
                kind: TraceKind::ThreadReap,
                object: None,
                thread: Some(thread),
                count: 0,
            },
        );
        debug!("reclaimed {thread}");
        result
    }

    fn reap(&self) -> usize {
        let corpses = core::mem::take(&mut *self.graveyard.lock());
        let count = corpses.len();
        for corpse in corpses {
            let thread = corpse.thread;
            if let Err(err) = self.reclaim(corpse) {
                warn!("reaping detached {thread}: {err}");
            }
        }
        count
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Handle to a runtime. Clones share the same context.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    kernel: Option<Arc<dyn Kernel>>,
    trace: Option<TraceHook>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Kernel port to run on; a default [`HostKernel`] otherwise.
    pub fn kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let kernel = self
            .kernel
            .unwrap_or_else(|| Arc::new(HostKernel::default()) as Arc<dyn Kernel>);
        Ok(Runtime::assemble(self.config, kernel, self.trace))
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// A runtime with the default configuration on `kernel`.
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self::assemble(RuntimeConfig::default(), kernel, None)
    }

    /// Process-wide runtime on a default [`HostKernel`], created on first
    /// use. Statically initialized objects bind to it.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| Runtime::new(Arc::new(HostKernel::default())))
    }

    fn assemble(config: RuntimeConfig, kernel: Arc<dyn Kernel>, trace: Option<TraceHook>) -> Self {
        let id = NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::new(SemPool::new(
            Arc::clone(&kernel),
            &config.name,
            config.sem_batch,
            trace.clone(),
        ));
        let keys = KeyTable::new(config.max_keys);
        debug!("runtime {id} ({}) created", config.name);
        Self {
            inner: Arc::new(RuntimeInner {
                id,
                config,
                kernel,
                pool,
                keys,
                threads: SpinLock::new(HashMap::new()),
                spawned: AtomicUsize::new(0),
                graveyard: SpinLock::new(Vec::new()),
                assoc: AssocTable::default(),
                trace,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.inner.kernel
    }

    pub(crate) fn kern(&self) -> &dyn Kernel {
        &*self.inner.kernel
    }

    pub(crate) fn pool(&self) -> &Arc<SemPool> {
        &self.inner.pool
    }

    pub(crate) fn keys(&self) -> &KeyTable {
        &self.inner.keys
    }

    pub(crate) fn assoc(&self) -> &AssocTable {
        &self.inner.assoc
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Capacity of the TSD key table.
    pub fn max_keys(&self) -> usize {
        self.inner.keys.capacity()
    }

    /// Forgets pooled kernel semaphores; call in the child after a fork.
    pub fn reset_after_fork(&self) {
        self.inner.pool.reset();
    }

    /// Registered thread records, adopted threads included.
    pub fn live_threads(&self) -> usize {
        self.inner.threads.lock().len()
    }

    pub fn same_as(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn current_thread(&self) -> Thread {
        Thread::new(self.clone(), self.current_record())
    }

    /// Yields the processor; a cancellation point for asynchronous cancel.
    pub fn yield_now(&self) {
        cancel::async_point(&self.current_record());
        self.inner.kernel.yield_now();
    }

    /// Reclaims detached threads that have exited. Returns how many.
    pub fn reap_detached(&self) -> usize {
        self.inner.reap()
    }

    /// The calling thread's record, adopting the thread on first contact.
    pub(crate) fn current_record(&self) -> Arc<ThreadRecord> {
        let id = self.inner.id;
        let found = INSTALLED.try_with(|installed| {
            installed
                .borrow()
                .iter()
                .find(|entry| entry.runtime == id)
                .map(|entry| Arc::clone(&entry.record))
        });
        match found {
            Ok(Some(record)) => record,
            Ok(None) => {
                drop(prune_orphans());
                let record = self.adopt();
                let entry = Installed {
                    runtime: id,
                    record: Arc::clone(&record),
                    adopted_by: Some(Arc::downgrade(&self.inner)),
                };
                if let Err(entry) = push_installed(entry) {
                    drop(entry);
                }
                record
            }
            // Thread-local storage is being torn down.
            Err(_) => self.adopt(),
        }
    }

    fn adopt(&self) -> Arc<ThreadRecord> {
        let record = Arc::new(ThreadRecord::new_adopted(
            ThreadId::next(),
            self.inner.kernel.current(),
            self.inner.config.max_keys,
        ));
        self.register(Arc::clone(&record));
        debug!("runtime {}: adopted {}", self.inner.id, record.id);
        record
    }

    pub(crate) fn install(&self, record: Arc<ThreadRecord>) {
        spinlock::bind_kernel(Arc::clone(&self.inner.kernel));
        let entry = Installed {
            runtime: self.inner.id,
            record,
            adopted_by: None,
        };
        if push_installed(entry).is_err() {
            warn!("runtime {}: thread-local storage unavailable", self.inner.id);
        }
    }

    pub(crate) fn uninstall(&self, thread: ThreadId) {
        let id = self.inner.id;
        let removed = INSTALLED.try_with(|installed| {
            let mut installed = installed.borrow_mut();
            installed
                .iter()
                .position(|entry| entry.runtime == id && entry.record.id == thread)
                .map(|pos| installed.swap_remove(pos))
        });
        drop(removed);
    }

    pub(crate) fn register(&self, record: Arc<ThreadRecord>) {
        self.inner.threads.lock().insert(record.id, record);
    }

    pub(crate) fn deregister(&self, thread: ThreadId) {
        let removed = self.inner.threads.lock().remove(&thread);
        drop(removed);
    }

    pub(crate) fn reserve_thread(&self) -> Result<()> {
        let live = self.inner.spawned.fetch_add(1, Ordering::AcqRel);
        if live >= self.inner.config.max_threads {
            self.inner.spawned.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ResourceExhausted("threads"));
        }
        Ok(())
    }

    pub(crate) fn release_thread(&self) {
        self.inner.spawned.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn reclaim(&self, corpse: Corpse) -> Result<()> {
        self.inner.reclaim(corpse)
    }

    /// Queues a detached thread's resources for reclamation by another thread.
    pub(crate) fn bury(&self, corpse: Corpse) {
        self.inner.graveyard.lock().push(corpse);
    }

    pub(crate) fn emit(
        &self,
        kind: TraceKind,
        object: Option<ObjectId>,
        thread: Option<ThreadId>,
        count: u64,
    ) {
        trace::emit(
            self.inner.trace.as_ref(),
            TraceRecord {
                kind,
                object,
                thread,
                count,
            },
        );
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .finish()
    }
}

/// Removes this thread's entries for dropped runtimes. They are returned so the
/// caller drops them outside the thread-local borrow.
fn prune_orphans() -> Vec<Installed> {
    INSTALLED
        .try_with(|installed| {
            let mut installed = installed.borrow_mut();
            let (orphans, live) = core::mem::take(&mut *installed)
                .into_iter()
                .partition(Installed::is_orphaned);
            *installed = live;
            orphans
        })
        .unwrap_or_default()
}

fn push_installed(entry: Installed) -> core::result::Result<(), Installed> {
    let mut slot = Some(entry);
    let pushed = INSTALLED.try_with(|installed| {
        if let Some(entry) = slot.take() {
            installed.borrow_mut().push(entry);
        }
    });
    match (pushed, slot) {
        (Err(_), Some(entry)) => Err(entry),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed_here() -> usize {
        INSTALLED.with(|installed| installed.borrow().len())
    }

    #[test]
    fn dropped_runtimes_release_adopted_entries() {
        for _ in 0..8 {
            let rt = Runtime::builder().build().unwrap();
            rt.current_thread();
        }
        assert!(installed_here() <= 1);

        let kept = Runtime::builder().build().unwrap();
        kept.current_thread();
        let extra = Runtime::builder().build().unwrap();
        extra.current_thread();
        assert_eq!(installed_here(), 2);
        assert_eq!(kept.live_threads(), 1);
    }

    #[test]
    fn association_table_links_and_unlinks() {
        let table = AssocTable::default();
        let (mutex, a, b) = (ObjectId::next(), ObjectId::next(), ObjectId::next());
        table.link(mutex, a);
        table.link(mutex, b);
        table.unlink(mutex, a);
        assert!(table.is_linked(mutex));
        table.unlink(mutex, b);
        assert!(!table.is_linked(mutex));
    }
}
