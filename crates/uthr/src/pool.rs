//! Process-wide cache of kernel semaphores.
//!
//! Mutexes and condition variables borrow a semaphore only while contended,
//! so the uncontended paths never reach the kernel. The pool keeps every
//! handle it has created in one array with a high-water index: entries at or
//! above `next` are free, entries below it are checked out. Checkout and
//! return are O(1) under the pool's own spinlock and never block.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use uthr_kernel::{Kernel, KernelError, KernelThreadId, SemHandle};

use crate::error::{Error, Result};
use crate::spinlock::SpinLock;
use crate::trace::{self, TraceHook, TraceKind, TraceRecord};

struct PoolState {
    handles: Vec<SemHandle>,
    next: usize,
    generation: u64,
}

/// Snapshot returned by [`SemPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles created and still owned by the pool.
    pub capacity: usize,
    pub checked_out: usize,
    /// Bumped by every [`SemPool::reset`].
    pub generation: u64,
}

impl PoolStats {
    pub fn free(&self) -> usize {
        self.capacity - self.checked_out
    }
}

pub struct SemPool {
    kernel: Arc<dyn Kernel>,
    name: String,
    batch: usize,
    trace: Option<TraceHook>,
    state: SpinLock<PoolState>,
}

impl SemPool {
    pub(crate) fn new(
        kernel: Arc<dyn Kernel>,
        name: &str,
        batch: usize,
        trace: Option<TraceHook>,
    ) -> Self {
        Self {
            kernel,
            name: name.to_owned(),
            batch: batch.max(1),
            trace,
            state: SpinLock::new(PoolState {
                handles: Vec::new(),
                next: 0,
                generation: 0,
            }),
        }
    }

    /// Borrows a semaphore, growing the pool by one batch when it is empty.
    pub fn checkout(self: &Arc<Self>) -> Result<SemLease> {
        let mut state = self.state.lock();
        if state.next == state.handles.len() {
            self.grow(&mut state)?;
        }
        let handle = state.handles[state.next];
        state.next += 1;
        Ok(SemLease {
            pool: Arc::clone(self),
            handle,
            generation: state.generation,
        })
    }

    fn grow(&self, state: &mut PoolState) -> Result<()> {
        let before = state.handles.len();
        for _ in 0..self.batch {
            let name = format!("{}.sem{}", self.name, state.handles.len());
            match self.kernel.sem_create(&name) {
                Ok(handle) => state.handles.push(handle),
                Err(err) if state.handles.len() == before => {
                    error!("semaphore pool: cannot create {name}: {err}");
                    return Err(Error::from(err));
                }
                // Keep the partial batch.
                Err(_) => break,
            }
        }
        debug!(
            "semaphore pool {} grew {} -> {}",
            self.name,
            before,
            state.handles.len()
        );
        trace::emit(
            self.trace.as_ref(),
            TraceRecord {
                kind: TraceKind::PoolGrow,
                object: None,
                thread: None,
                count: state.handles.len() as u64,
            },
        );
        Ok(())
    }

    fn give_back(&self, handle: SemHandle, generation: u64) {
        let mut state = self.state.lock();
        if generation != state.generation {
            // Checked out before a reset; the handle is not ours any more.
            return;
        }
        state.next -= 1;
        let slot = state.next;
        state.handles[slot] = handle;
    }

    /// Forgets every handle without destroying it.
    ///
    /// Meant for a child process after a fork-like duplication: the handles
    /// belong to the parent. Leases taken earlier are dropped silently.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.handles.clear();
        state.next = 0;
        state.generation += 1;
        debug!("semaphore pool {} reset", self.name);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: state.handles.len(),
            checked_out: state.next,
            generation: state.generation,
        }
    }
}

impl Drop for SemPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for handle in state.handles.drain(..) {
            if let Err(err) = self.kernel.sem_destroy(handle) {
                debug!("semaphore pool: destroy {handle}: {err}");
            }
        }
    }
}

/// A semaphore borrowed from the pool, returned when dropped.
pub struct SemLease {
    pool: Arc<SemPool>,
    handle: SemHandle,
    generation: u64,
}

impl SemLease {
    pub fn handle(&self) -> SemHandle {
        self.handle
    }
}

impl core::fmt::Debug for SemLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SemLease({})", self.handle)
    }
}

impl Drop for SemLease {
    fn drop(&mut self) {
        self.pool.give_back(self.handle, self.generation);
    }
}

/// Waits on a pool semaphore. `false` on timeout; any other kernel failure
/// means the semaphore was corrupted and is fatal.
pub(crate) fn wait(kernel: &dyn Kernel, sem: SemHandle, timeout: Option<Duration>) -> bool {
    match kernel.sem_wait(sem, timeout) {
        Ok(()) => true,
        Err(KernelError::TimedOut) => false,
        Err(err) => {
            error!("wait on pool semaphore {sem} failed: {err}");
            panic!("wait on pool semaphore {sem} failed: {err}");
        }
    }
}

/// Consumes a token addressed to the caller if one is banked.
pub(crate) fn drain(kernel: &dyn Kernel, sem: SemHandle) {
    wait(kernel, sem, Some(Duration::ZERO));
}

pub(crate) fn post(kernel: &dyn Kernel, sem: SemHandle) {
    if let Err(err) = kernel.sem_post(sem) {
        error!("post to pool semaphore {sem} failed: {err}");
        panic!("post to pool semaphore {sem} failed: {err}");
    }
}

pub(crate) fn post_to(kernel: &dyn Kernel, sem: SemHandle, target: KernelThreadId) {
    if let Err(err) = kernel.sem_post_to(sem, target) {
        error!("post to pool semaphore {sem} failed: {err}");
        panic!("post to pool semaphore {sem} failed: {err}");
    }
}
