//! Writer-preferring reader-writer lock built from one [`Mutex`] and two
//! [`CondVar`]s.
//!
//! `state` is 0 when unlocked, the number of readers when positive and -1
//! while a writer holds the lock. New readers wait while a writer holds the
//! lock *or* any writer is blocked, so a stream of readers cannot starve a
//! writer.

use core::fmt;
use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::condvar::CondVar;
use crate::error::{Error, Result};
use crate::mutex::{Mutex, MutexKind};
use crate::object::{SigState, Signature, SIG_RWLOCK};
use crate::runtime::Runtime;
use crate::spinlock::SpinLock;
use crate::thread::ThreadId;

pub struct RwLock {
    sig: Signature,
    mutex: Mutex,
    readers_ok: CondVar,
    writers_ok: CondVar,
    state: AtomicI64,
    blocked_writers: AtomicU32,
    writer: SpinLock<Option<ThreadId>>,
}

#[derive(Clone, Copy)]
enum Mode {
    Block(Option<Instant>),
    Try,
}

impl RwLock {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            sig: Signature::new_live(SIG_RWLOCK, "rwlock"),
            mutex: Mutex::new(rt, MutexKind::Normal),
            readers_ok: CondVar::new(rt),
            writers_ok: CondVar::new(rt),
            state: AtomicI64::new(0),
            blocked_writers: AtomicU32::new(0),
            writer: SpinLock::new(None),
        }
    }

    /// Static initializer. Binds to [`Runtime::global`] on first use.
    pub const fn new_static() -> Self {
        Self {
            sig: Signature::new_static(SIG_RWLOCK, "rwlock"),
            mutex: Mutex::new_static(MutexKind::Normal),
            readers_ok: CondVar::new_static(),
            writers_ok: CondVar::new_static(),
            state: AtomicI64::new(0),
            blocked_writers: AtomicU32::new(0),
            writer: SpinLock::new(None),
        }
    }

    pub fn read_lock(&self) -> Result<()> {
        self.read(Mode::Block(None))
    }

    /// `Busy` while a writer holds the lock or is waiting for it.
    pub fn try_read_lock(&self) -> Result<()> {
        self.read(Mode::Try)
    }

    pub fn read_lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.read(Mode::Block(Instant::now().checked_add(timeout)))
    }

    pub fn write_lock(&self) -> Result<()> {
        self.write(Mode::Block(None))
    }

    pub fn try_write_lock(&self) -> Result<()> {
        self.write(Mode::Try)
    }

    pub fn write_lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.write(Mode::Block(Instant::now().checked_add(timeout)))
    }

    /// Releases a read or the write lock. A writer lock may only be released
    /// by its owner.
    pub fn unlock(&self) -> Result<()> {
        self.check()?;
        self.mutex.lock()?;
        let result = self.release();
        self.mutex.unlock()?;
        result
    }

    /// Fails with `Busy` while held or while writers wait.
    pub fn destroy(&self) -> Result<()> {
        if self.sig.state()? == SigState::Static {
            self.sig.retire();
            return Ok(());
        }
        self.mutex.lock()?;
        let busy = self.state.load(Ordering::Acquire) != 0
            || self.blocked_writers.load(Ordering::Acquire) > 0
            || self.readers_ok.is_busy()
            || self.writers_ok.is_busy();
        self.mutex.unlock()?;
        if busy {
            return Err(Error::Busy);
        }
        self.readers_ok.destroy()?;
        self.writers_ok.destroy()?;
        self.mutex.destroy()?;
        self.sig.retire();
        Ok(())
    }

    /// Active readers.
    pub fn readers(&self) -> usize {
        self.state.load(Ordering::Acquire).max(0) as usize
    }

    pub fn blocked_writers(&self) -> u32 {
        self.blocked_writers.load(Ordering::Acquire)
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) < 0
    }

    pub fn writer(&self) -> Option<ThreadId> {
        *self.writer.lock()
    }

    fn check(&self) -> Result<()> {
        if self.sig.state()? == SigState::Static {
            self.sig.promote();
        }
        self.sig.check_live()
    }

    /// Identity of the caller; the internal mutex must be bound.
    fn caller(&self) -> Result<ThreadId> {
        Ok(self.mutex.binding()?.rt.current_record().id)
    }

    fn read(&self, mode: Mode) -> Result<()> {
        self.check()?;
        self.mutex.lock()?;
        let result = self.read_locked(mode);
        self.mutex.unlock()?;
        result
    }

    fn read_locked(&self, mode: Mode) -> Result<()> {
        let me = self.caller()?;
        if *self.writer.lock() == Some(me) {
            return Err(Error::WouldDeadlock);
        }
        while self.state.load(Ordering::Acquire) < 0
            || self.blocked_writers.load(Ordering::Acquire) > 0
        {
            match mode {
                Mode::Try => return Err(Error::Busy),
                Mode::Block(deadline) => self.readers_ok.wait_plain(&self.mutex, deadline)?,
            }
        }
        self.state.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn write(&self, mode: Mode) -> Result<()> {
        self.check()?;
        self.mutex.lock()?;
        let result = self.write_locked(mode);
        self.mutex.unlock()?;
        result
    }

    fn write_locked(&self, mode: Mode) -> Result<()> {
        let me = self.caller()?;
        if *self.writer.lock() == Some(me) {
            return Err(Error::WouldDeadlock);
        }
        let deadline = match mode {
            Mode::Try if self.state.load(Ordering::Acquire) != 0 => return Err(Error::Busy),
            Mode::Try => None,
            Mode::Block(deadline) => deadline,
        };

        self.blocked_writers.fetch_add(1, Ordering::AcqRel);
        while self.state.load(Ordering::Acquire) != 0 {
            if let Err(err) = self.writers_ok.wait_plain(&self.mutex, deadline) {
                // Withdraw the preference; readers held back only by this
                // writer may go.
                let left = self.blocked_writers.fetch_sub(1, Ordering::AcqRel) - 1;
                if left == 0 && self.state.load(Ordering::Acquire) >= 0 {
                    self.readers_ok.broadcast()?;
                }
                return Err(err);
            }
        }
        self.blocked_writers.fetch_sub(1, Ordering::AcqRel);
        self.state.store(-1, Ordering::Release);
        *self.writer.lock() = Some(me);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let state = self.state.load(Ordering::Acquire);
        if state > 0 {
            let left = self.state.fetch_sub(1, Ordering::AcqRel) - 1;
            if left == 0 && self.blocked_writers.load(Ordering::Acquire) > 0 {
                self.writers_ok.signal()?;
            }
            return Ok(());
        }
        if state < 0 {
            let me = self.caller()?;
            let mut writer = self.writer.lock();
            if *writer != Some(me) {
                return Err(Error::NotOwner);
            }
            *writer = None;
            drop(writer);
            self.state.store(0, Ordering::Release);
            if self.blocked_writers.load(Ordering::Acquire) > 0 {
                self.writers_ok.signal()?;
            } else {
                self.readers_ok.broadcast()?;
            }
            return Ok(());
        }
        Err(Error::NotOwner)
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.readers())
            .field("write_locked", &self.is_write_locked())
            .field("blocked_writers", &self.blocked_writers())
            .finish()
    }
}
