//! Test-and-set spinlock protecting the control blocks of the higher-level
//! objects.
//!
//! A holder must never block (semaphore wait, join, suspension) and must never
//! re-acquire the same lock. Contention spins for a bounded number of tries and
//! then backs off through the `R` relax strategy. The default, [`KernelYield`],
//! yields through the [`Kernel`] of the runtime that created the calling
//! thread; threads the runtime did not create yield through the OS.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::RefCell;
use std::sync::Arc;

use spin::relax::{RelaxStrategy, Spin, Yield};
use uthr_kernel::Kernel;

/// Busy-spin attempts between yields.
pub const SPIN_TRIES: u32 = 64;

thread_local! {
    static KERNEL: RefCell<Option<Arc<dyn Kernel>>> = const { RefCell::new(None) };
}

/// Routes [`KernelYield`] on the calling thread through `kernel`.
pub(crate) fn bind_kernel(kernel: Arc<dyn Kernel>) {
    let _ = KERNEL.try_with(|slot| *slot.borrow_mut() = Some(kernel));
}

/// Backs off with [`Kernel::yield_now`] of the calling thread's runtime.
pub struct KernelYield;

impl RelaxStrategy for KernelYield {
    fn relax() {
        let routed = KERNEL
            .try_with(|slot| match slot.try_borrow().as_deref() {
                Ok(Some(kernel)) => {
                    kernel.yield_now();
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if !routed {
            Yield::relax();
        }
    }
}

pub struct SpinLock<T: ?Sized, R = KernelYield> {
    locked: AtomicBool,
    relax: PhantomData<R>,
    data: UnsafeCell<T>,
}

// Safety: the flag serialises every access to `data`.
unsafe impl<T: ?Sized + Send, R> Send for SpinLock<T, R> {}
unsafe impl<T: ?Sized + Send, R> Sync for SpinLock<T, R> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self::with_relax(value)
    }
}

impl<T, R> SpinLock<T, R> {
    /// A lock that backs off through `R` instead of yielding.
    pub const fn with_relax(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            relax: PhantomData,
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, R: RelaxStrategy> SpinLock<T, R> {
    /// Single test-and-set; never waits.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, R>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T, R> {
        loop {
            for _ in 0..SPIN_TRIES {
                if !self.locked.load(Ordering::Relaxed) {
                    if let Some(guard) = self.try_lock() {
                        return guard;
                    }
                }
                Spin::relax();
            }
            R::relax();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default, R> Default for SpinLock<T, R> {
    fn default() -> Self {
        Self::with_relax(T::default())
    }
}

impl<T: ?Sized + fmt::Debug, R: RelaxStrategy> fmt::Debug for SpinLock<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

pub struct SpinLockGuard<'a, T: ?Sized, R = KernelYield> {
    lock: &'a SpinLock<T, R>,
}

impl<T: ?Sized, R> Deref for SpinLockGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized, R> DerefMut for SpinLockGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized, R> Drop for SpinLockGuard<'_, T, R> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
