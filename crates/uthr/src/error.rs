//! Error taxonomy shared by every object in the crate.

use thiserror::Error;
use uthr_kernel::KernelError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad, destroyed or never-initialized object, or an out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Destroy while in use, or try-lock contention.
    #[error("resource busy")]
    Busy,
    #[error("operation would deadlock")]
    WouldDeadlock,
    #[error("caller does not own the lock")]
    NotOwner,
    #[error("timed out")]
    TimedOut,
    #[error("{0} exhausted")]
    ResourceExhausted(&'static str),
    /// Join or detach on a thread that is not in a joinable state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("kernel: {0}")]
    Kernel(KernelError),
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::TimedOut => Error::TimedOut,
            KernelError::Exhausted(what) => Error::ResourceExhausted(what),
            KernelError::InvalidArgument(what) => Error::InvalidArgument(what),
            other => Error::Kernel(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_errors_map_onto_taxonomy() {
        assert_eq!(Error::from(KernelError::TimedOut), Error::TimedOut);
        assert_eq!(
            Error::from(KernelError::Exhausted("kernel semaphores")),
            Error::ResourceExhausted("kernel semaphores")
        );
        assert_eq!(
            Error::from(KernelError::BadHandle),
            Error::Kernel(KernelError::BadHandle)
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::ResourceExhausted("thread keys").to_string(),
            "thread keys exhausted"
        );
        assert_eq!(Error::WouldDeadlock.to_string(), "operation would deadlock");
    }
}
