//! Cancellation, explicit exit, and cleanup handlers.
//!
//! Exit and cancellation unwind the calling thread back to its trampoline
//! with a private payload, so Rust destructors on the way run as usual. The
//! trampoline then runs the thread's cleanup handlers (most recent first)
//! exactly as it does after a normal return.

use core::any::Any;
use core::sync::atomic::Ordering;
use std::panic::{self, AssertUnwindSafe};

use log::warn;

use super::{ThreadExit, ThreadId, ThreadRecord};
use crate::runtime::Runtime;

const DISABLED: u8 = 1 << 0;
const ASYNCHRONOUS: u8 = 1 << 1;
const PENDING: u8 = 1 << 2;
/// Set once the thread started exiting; no further cancellation is acted on.
const EXITING: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    /// Acted on only at cancellation points.
    Deferred,
    /// Additionally acted on at mutex lock, yield, and when switching type
    /// or state.
    Asynchronous,
}

/// Unwind payload raised by [`Runtime::exit`] and by acting on a cancel.
enum Unwind {
    Exit(Box<dyn Any + Send>),
    Cancel,
}

/// Marks a cancel pending; `true` if the target would act on it.
pub(crate) fn request(record: &ThreadRecord) -> bool {
    let bits = record.cancel.fetch_or(PENDING, Ordering::SeqCst);
    bits & (DISABLED | EXITING) == 0
}

pub(crate) fn actionable(record: &ThreadRecord) -> bool {
    let bits = record.cancel.load(Ordering::SeqCst);
    bits & PENDING != 0
        && bits & (DISABLED | EXITING) == 0
        && !record.adopted
        && !std::thread::panicking()
}

pub(crate) fn act(record: &ThreadRecord) -> ! {
    record.cancel.fetch_or(EXITING, Ordering::SeqCst);
    panic::resume_unwind(Box::new(Unwind::Cancel))
}

/// Deferred cancellation point.
pub(crate) fn point(record: &ThreadRecord) {
    if actionable(record) {
        act(record);
    }
}

/// Cancellation point for asynchronous-type threads only.
pub(crate) fn async_point(record: &ThreadRecord) {
    if record.cancel.load(Ordering::Relaxed) & ASYNCHRONOUS != 0 {
        point(record);
    }
}

pub(crate) fn begin_exit(record: &ThreadRecord) {
    record.cancel.fetch_or(EXITING, Ordering::SeqCst);
}

/// Turns whatever unwound out of a thread function into its exit status.
pub(crate) fn classify(thread: ThreadId, payload: Box<dyn Any + Send>) -> ThreadExit {
    match payload.downcast::<Unwind>() {
        Ok(unwind) => match *unwind {
            Unwind::Exit(value) => ThreadExit::Value(value),
            Unwind::Cancel => ThreadExit::Canceled,
        },
        Err(payload) => {
            warn!("{thread} panicked");
            ThreadExit::Panicked(payload)
        }
    }
}

pub(crate) fn run_cleanup(record: &ThreadRecord) {
    loop {
        let handler = record.cleanup.lock().pop();
        let Some(handler) = handler else { break };
        if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
            warn!("{}: cleanup handler panicked", record.id);
        }
    }
}

impl Runtime {
    /// Explicit cancellation point.
    pub fn test_cancel(&self) {
        point(&self.current_record());
    }

    /// Sets the calling thread's cancel state and returns the previous one.
    pub fn set_cancel_state(&self, state: CancelState) -> CancelState {
        let record = self.current_record();
        let old = match state {
            CancelState::Enabled => record.cancel.fetch_and(!DISABLED, Ordering::SeqCst),
            CancelState::Disabled => record.cancel.fetch_or(DISABLED, Ordering::SeqCst),
        };
        async_point(&record);
        if old & DISABLED != 0 {
            CancelState::Disabled
        } else {
            CancelState::Enabled
        }
    }

    /// Sets the calling thread's cancel type and returns the previous one.
    pub fn set_cancel_type(&self, kind: CancelType) -> CancelType {
        let record = self.current_record();
        let old = match kind {
            CancelType::Deferred => record.cancel.fetch_and(!ASYNCHRONOUS, Ordering::SeqCst),
            CancelType::Asynchronous => record.cancel.fetch_or(ASYNCHRONOUS, Ordering::SeqCst),
        };
        async_point(&record);
        if old & ASYNCHRONOUS != 0 {
            CancelType::Asynchronous
        } else {
            CancelType::Deferred
        }
    }

    /// Registers a handler run if the thread exits, is cancelled, or returns
    /// before the matching [`Runtime::pop_cleanup`].
    pub fn push_cleanup<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_record().cleanup.lock().push(Box::new(handler));
    }

    /// Removes the most recent handler, running it when `execute` is set.
    /// Returns `false` if there was none.
    pub fn pop_cleanup(&self, execute: bool) -> bool {
        let handler = self.current_record().cleanup.lock().pop();
        match handler {
            Some(handler) => {
                if execute {
                    handler();
                }
                true
            }
            None => false,
        }
    }

    /// Ends the calling thread with `value` as its exit value.
    ///
    /// Unwinds to the thread's entry point. On a thread the runtime did not
    /// create this behaves like a panic carrying an opaque payload.
    pub fn exit<T: Send + 'static>(&self, value: T) -> ! {
        begin_exit(&self.current_record());
        panic::resume_unwind(Box::new(Unwind::Exit(Box::new(value))))
    }
}
