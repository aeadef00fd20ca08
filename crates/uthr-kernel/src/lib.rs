//! # uthr-kernel
//!
//! The porting seam between the `uthr` threading runtime and whatever kernel
//! actually schedules threads. A port supplies four families of primitives:
//!
//! - kernel thread creation (optionally suspended) at an entry point on a
//!   caller-provided stack region,
//! - suspend / resume / terminate by handle,
//! - named binary semaphores with wait, timed wait, signal and
//!   signal-to-a-specific-thread,
//! - page-aligned stack regions with a guard area.
//!
//! Everything above this crate (mutexes, condition variables, the thread
//! lifecycle) is written against the [`Kernel`] trait only. The [`host`]
//! module provides a port on top of `std::thread` and `parking_lot`.

use core::fmt;
use core::time::Duration;

use thiserror::Error;

pub mod host;

pub use host::{HostConfig, HostConfigBuilder, HostKernel, KernelStats};

/// Kernel identity of a schedulable thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelThreadId(pub u64);

impl fmt::Display for KernelThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kt#{}", self.0)
    }
}

/// Owned handle to a kernel thread.
///
/// Deliberately not `Clone`: [`Kernel::terminate`] consumes it, so a thread
/// can be reclaimed at most once.
#[derive(Debug)]
pub struct KernelThread {
    id: KernelThreadId,
}

impl KernelThread {
    /// Wraps a kernel identity. Only ports should construct handles.
    pub fn new(id: KernelThreadId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> KernelThreadId {
        self.id
    }
}

/// Handle to a named binary kernel semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemHandle(pub u32);

impl fmt::Display for SemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem#{}", self.0)
    }
}

/// A page-aligned stack mapping with a guard area in the growth direction.
///
/// Not `Clone` for the same reason as [`KernelThread`]: unmapping consumes it.
#[derive(Debug)]
pub struct StackRegion {
    token: u64,
    usable: usize,
    guard: usize,
}

impl StackRegion {
    pub fn new(token: u64, usable: usize, guard: usize) -> Self {
        Self {
            token,
            usable,
            guard,
        }
    }

    /// Port-defined identity of the mapping.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Bytes available to the thread.
    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Bytes reserved (and protected) beyond the usable area.
    pub fn guard_size(&self) -> usize {
        self.guard
    }

    /// Whole mapping including the guard area.
    pub fn mapped_size(&self) -> usize {
        self.usable + self.guard
    }
}

/// Scheduling policy understood by the seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    RoundRobin,
}

/// Policy plus priority. Higher priority values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedParam {
    pub policy: SchedPolicy,
    pub priority: i32,
}

impl SchedParam {
    pub const MIN_REALTIME_PRIORITY: i32 = 1;
    pub const MAX_REALTIME_PRIORITY: i32 = 99;

    pub const fn new(policy: SchedPolicy, priority: i32) -> Self {
        Self { policy, priority }
    }

    /// Checks the priority range for the policy.
    pub fn validate(&self) -> Result<(), KernelError> {
        let ok = match self.policy {
            SchedPolicy::Other => self.priority == 0,
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => (Self::MIN_REALTIME_PRIORITY
                ..=Self::MAX_REALTIME_PRIORITY)
                .contains(&self.priority),
        };
        if ok {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument("priority out of range for policy"))
        }
    }
}

/// Entry point handed to [`Kernel::spawn`].
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Failures reported by a port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("timed out")]
    TimedOut,
    #[error("{0} exhausted")]
    Exhausted(&'static str),
    #[error("bad kernel handle")]
    BadHandle,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("thread spawn failed: {0}")]
    Spawn(String),
    #[error("kernel thread crashed")]
    Crashed,
}

pub type KernelResult<T> = Result<T, KernelError>;

/// The primitives a port must provide.
pub trait Kernel: Send + Sync + 'static {
    /// Kernel identity of the calling thread.
    fn current(&self) -> KernelThreadId;

    /// Creates a thread running `entry` on a stack described by `stack`.
    ///
    /// With `suspended` set the thread does not run until [`Kernel::resume`].
    fn spawn(
        &self,
        name: &str,
        stack: &StackRegion,
        suspended: bool,
        entry: Entry,
    ) -> KernelResult<KernelThread>;

    fn resume(&self, thread: KernelThreadId) -> KernelResult<()>;

    fn suspend(&self, thread: KernelThreadId) -> KernelResult<()>;

    fn set_sched(&self, thread: KernelThreadId, param: SchedParam) -> KernelResult<()>;

    /// Reclaims a thread. A thread that was never resumed is discarded
    /// without running; otherwise the call waits for its entry to return.
    fn terminate(&self, thread: KernelThread) -> KernelResult<()>;

    fn yield_now(&self);

    fn sem_create(&self, name: &str) -> KernelResult<SemHandle>;

    fn sem_destroy(&self, sem: SemHandle) -> KernelResult<()>;

    /// Consumes a token addressed to the caller, else an anonymous token,
    /// else blocks. `None` waits forever.
    fn sem_wait(&self, sem: SemHandle, timeout: Option<Duration>) -> KernelResult<()>;

    /// Banks one anonymous token. Binary: a second post before a wait is lost.
    fn sem_post(&self, sem: SemHandle) -> KernelResult<()>;

    /// Banks one token only `target` may consume.
    fn sem_post_to(&self, sem: SemHandle, target: KernelThreadId) -> KernelResult<()>;

    fn page_size(&self) -> usize;

    /// Maps `usable` bytes of stack plus `guard` bytes of guard area, both
    /// rounded up to the page size.
    fn map_stack(&self, usable: usize, guard: usize) -> KernelResult<StackRegion>;

    fn unmap_stack(&self, stack: StackRegion) -> KernelResult<()>;
}

/// Rounds `bytes` up to a multiple of `page`.
pub fn round_to_page(bytes: usize, page: usize) -> usize {
    if page == 0 {
        return bytes;
    }
    bytes.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sched_param_ranges() {
        assert!(SchedParam::default().validate().is_ok());
        assert!(SchedParam::new(SchedPolicy::Other, 3).validate().is_err());
        assert!(SchedParam::new(SchedPolicy::Fifo, 1).validate().is_ok());
        assert!(SchedParam::new(SchedPolicy::RoundRobin, 99).validate().is_ok());
        assert!(SchedParam::new(SchedPolicy::Fifo, 0).validate().is_err());
        assert!(SchedParam::new(SchedPolicy::Fifo, 100).validate().is_err());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_to_page(0, 4096), 0);
        assert_eq!(round_to_page(1, 4096), 4096);
        assert_eq!(round_to_page(4096, 4096), 4096);
        assert_eq!(round_to_page(4097, 4096), 8192);
        assert_eq!(round_to_page(17, 0), 17);
    }

    #[test]
    fn stack_region_sizes() {
        let region = StackRegion::new(7, 8192, 4096);
        assert_eq!(region.token(), 7);
        assert_eq!(region.mapped_size(), 12288);
    }
}
