//! # uthr
//!
//! POSIX-style threading for user space on top of a minimal kernel seam
//! ([`uthr_kernel::Kernel`]): kernel threads, binary semaphores with directed
//! posts, and page-aligned stack regions. Everything else is built here.
//!
//! ## Module Overview
//! - [`spinlock`] – Bounded-spin lock protecting every control block.
//! - [`pool`]     – Cache of kernel semaphores borrowed only under contention.
//! - [`mutex`]    – Normal, recursive and error-checking mutexes with hand-off.
//! - [`condvar`]  – Condition variables with directed and priority wake-up.
//! - [`rwlock`]   – Writer-preferring reader-writer lock.
//! - [`thread`]   – Creation, join, detach, exit and cancellation.
//! - [`tsd`]      – Thread-specific data keys with destructors.
//! - [`runtime`]  – The context object that owns all of the shared state.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use uthr::{CondVar, Mutex, MutexKind, Runtime};
//!
//! let rt = Runtime::builder().build()?;
//! let shared = Arc::new((
//!     Mutex::new(&rt, MutexKind::Normal),
//!     CondVar::new(&rt),
//!     AtomicBool::new(false),
//! ));
//!
//! let waiter = {
//!     let shared = Arc::clone(&shared);
//!     rt.spawn(move || -> uthr::Result<()> {
//!         let (mutex, cond, ready) = &*shared;
//!         mutex.lock()?;
//!         while !ready.load(Ordering::Relaxed) {
//!             cond.wait(mutex)?;
//!         }
//!         mutex.unlock()
//!     })?
//! };
//!
//! let (mutex, cond, ready) = &*shared;
//! mutex.lock()?;
//! ready.store(true, Ordering::Relaxed);
//! cond.signal()?;
//! mutex.unlock()?;
//! waiter.join()?;
//! # Ok::<(), uthr::Error>(())
//! ```

pub mod condvar;
pub mod config;
pub mod error;
pub mod mutex;
pub mod object;
pub mod pool;
pub mod runtime;
pub mod rwlock;
pub mod spinlock;
pub mod thread;
pub mod trace;
pub mod tsd;

pub use condvar::CondVar;
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{Error, Result};
pub use mutex::{Mutex, MutexGuard, MutexKind, Owner};
pub use object::ObjectId;
pub use pool::{PoolStats, SemLease};
pub use runtime::{Runtime, RuntimeBuilder};
pub use rwlock::RwLock;
pub use spinlock::{KernelYield, SpinLock, SpinLockGuard};
pub use thread::{CancelState, CancelType, JoinState, Thread, ThreadAttr, ThreadExit, ThreadId};
pub use trace::{TraceHook, TraceKind, TraceRecord};
pub use tsd::{Destructor, Key};
pub use uthr_kernel::{
    HostConfig, HostKernel, Kernel, KernelError, KernelStats, SchedParam, SchedPolicy,
};
