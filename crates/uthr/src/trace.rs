//! Typed trace records emitted to an optional user hook.

use std::sync::Arc;

use crate::object::ObjectId;
use crate::thread::ThreadId;

/// Record kinds. Discriminants are stable so hooks may forward them as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceKind {
    MutexContended = 70,
    MutexHandoff = 71,
    CondWait = 72,
    CondSignal = 73,
    CondBroadcast = 74,
    ThreadCreate = 75,
    ThreadExit = 76,
    ThreadReap = 77,
    PoolGrow = 78,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub kind: TraceKind,
    /// Object the record is about, if any.
    pub object: Option<ObjectId>,
    /// Thread the record is about, if any.
    pub thread: Option<ThreadId>,
    /// Kind-specific count (pool size, woken waiters).
    pub count: u64,
}

pub type TraceHook = Arc<dyn Fn(&TraceRecord) + Send + Sync>;

pub(crate) fn emit(hook: Option<&TraceHook>, record: TraceRecord) {
    if let Some(hook) = hook {
        hook(&record);
    }
}
