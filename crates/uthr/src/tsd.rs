//! Thread-specific data.
//!
//! A fixed-capacity key table is shared by all threads of a runtime; every
//! thread record carries one value slot per key. Values are opaque words and
//! 0 means "no value". Keys carry a generation so a recycled table slot never
//! exposes a value stored under a deleted key.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::spinlock::SpinLock;
use crate::thread::ThreadRecord;

/// Called at thread exit with the thread's non-zero value for a key.
pub type Destructor = Arc<dyn Fn(usize) + Send + Sync + 'static>;

/// Handle returned by [`Runtime::create_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    /// Slot index plus one; 0 is never a valid key.
    index: u32,
    seq: u32,
}

impl Key {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn slot(&self) -> Option<usize> {
        (self.index as usize).checked_sub(1)
    }
}

struct KeySlot {
    in_use: AtomicBool,
    seq: AtomicU32,
    destructor: SpinLock<Option<Destructor>>,
}

pub(crate) struct KeyTable {
    slots: Box<[KeySlot]>,
    lock: SpinLock<()>,
}

/// Per-thread value cell for one key.
#[derive(Default)]
pub(crate) struct TsdSlot {
    seq: AtomicU32,
    value: AtomicUsize,
}

impl KeyTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| KeySlot {
                    in_use: AtomicBool::new(false),
                    seq: AtomicU32::new(0),
                    destructor: SpinLock::new(None),
                })
                .collect(),
            lock: SpinLock::new(()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn create(&self, destructor: Option<Destructor>) -> Result<Key> {
        let _guard = self.lock.lock();
        let (index, slot) = self
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| !slot.in_use.load(Ordering::Relaxed))
            .ok_or(Error::ResourceExhausted("thread-specific data keys"))?;

        let mut seq = slot.seq.load(Ordering::Relaxed).wrapping_add(1);
        if seq == 0 {
            seq = 1;
        }
        slot.seq.store(seq, Ordering::Relaxed);
        *slot.destructor.lock() = destructor;
        slot.in_use.store(true, Ordering::Release);
        Ok(Key {
            index: index as u32 + 1,
            seq,
        })
    }

    fn delete(&self, key: Key) -> Result<()> {
        let _guard = self.lock.lock();
        let slot = self.live_slot(key)?;
        slot.in_use.store(false, Ordering::Release);
        *slot.destructor.lock() = None;
        Ok(())
    }

    fn live_slot(&self, key: Key) -> Result<&KeySlot> {
        let slot = key
            .slot()
            .and_then(|index| self.slots.get(index))
            .ok_or(Error::InvalidArgument("unknown key"))?;
        if slot.in_use.load(Ordering::Acquire) && slot.seq.load(Ordering::Relaxed) == key.seq {
            Ok(slot)
        } else {
            Err(Error::InvalidArgument("deleted key"))
        }
    }

    fn set(&self, record: &ThreadRecord, key: Key, value: usize) -> Result<()> {
        self.live_slot(key)?;
        let index = key.slot().ok_or(Error::InvalidArgument("unknown key"))?;
        let cell = record
            .tsd
            .get(index)
            .ok_or(Error::InvalidArgument("unknown key"))?;
        cell.seq.store(key.seq, Ordering::Relaxed);
        cell.value.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, record: &ThreadRecord, key: Key) -> usize {
        if self.live_slot(key).is_err() {
            return 0;
        }
        match key.slot().and_then(|index| record.tsd.get(index)) {
            Some(cell) if cell.seq.load(Ordering::Relaxed) == key.seq => {
                cell.value.load(Ordering::Relaxed)
            }
            _ => 0,
        }
    }

    /// Runs destructors for the exiting thread, repeating while a pass still
    /// found values, up to `passes` times.
    pub(crate) fn run_destructors(&self, record: &ThreadRecord, passes: usize) {
        for pass in 0..passes {
            let mut ran = false;
            for (slot, cell) in self.slots.iter().zip(record.tsd.iter()) {
                if !slot.in_use.load(Ordering::Acquire) {
                    continue;
                }
                let seq = slot.seq.load(Ordering::Relaxed);
                if cell.seq.load(Ordering::Relaxed) != seq {
                    continue;
                }
                let value = cell.value.swap(0, Ordering::Relaxed);
                if value == 0 {
                    continue;
                }
                let Some(destructor) = slot.destructor.lock().clone() else {
                    continue;
                };
                ran = true;
                if panic::catch_unwind(AssertUnwindSafe(|| destructor(value))).is_err() {
                    warn!("{}: key destructor panicked", record.id);
                }
            }
            if !ran {
                return;
            }
            debug!("{}: destructor pass {} done", record.id, pass + 1);
        }
        let leftover = record
            .tsd
            .iter()
            .filter(|cell| cell.value.load(Ordering::Relaxed) != 0)
            .count();
        if leftover > 0 {
            debug!(
                "{}: {leftover} values left after {passes} destructor passes",
                record.id
            );
        }
    }
}

impl Runtime {
    /// Creates a key without a destructor.
    pub fn create_key(&self) -> Result<Key> {
        self.keys().create(None)
    }

    /// Creates a key whose destructor runs at thread exit for every thread
    /// holding a non-zero value.
    pub fn create_key_with<F>(&self, destructor: F) -> Result<Key>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.keys().create(Some(Arc::new(destructor)))
    }

    /// Frees the key. Values stored under it are orphaned, not destroyed.
    pub fn delete_key(&self, key: Key) -> Result<()> {
        self.keys().delete(key)
    }

    pub fn set_specific(&self, key: Key, value: usize) -> Result<()> {
        self.keys().set(&self.current_record(), key, value)
    }

    /// The calling thread's value for `key`, 0 if unset or the key is gone.
    pub fn get_specific(&self, key: Key) -> usize {
        self.keys().get(&self.current_record(), key)
    }

    pub(crate) fn run_destructors(&self, record: &ThreadRecord) {
        self.keys()
            .run_destructors(record, self.config().destructor_passes);
    }
}
