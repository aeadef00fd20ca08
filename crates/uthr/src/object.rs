//! Object identity and signature tags.
//!
//! Every synchronization object carries a signature word. A `const`
//! initializer leaves it in the static state; first use promotes it to the
//! object's live tag; destroy retires it. Any other value means the object
//! memory was corrupted and is treated as fatal.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::error;

use crate::error::{Error, Result};

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a mutex, condition variable or rwlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next() -> Self {
        ObjectId(NEXT_OBJECT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

pub(crate) const SIG_MUTEX: u32 = 0x4d55_5458;
pub(crate) const SIG_COND: u32 = 0x434f_4e44;
pub(crate) const SIG_RWLOCK: u32 = 0x5257_4c4b;

const SIG_STATIC: u32 = 0x5354_4154;
const SIG_DESTROYED: u32 = 0xdead_0b1e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SigState {
    Static,
    Live,
}

pub(crate) struct Signature {
    word: AtomicU32,
    live: u32,
    what: &'static str,
}

impl Signature {
    pub(crate) const fn new_static(live: u32, what: &'static str) -> Self {
        Self {
            word: AtomicU32::new(SIG_STATIC),
            live,
            what,
        }
    }

    pub(crate) const fn new_live(live: u32, what: &'static str) -> Self {
        Self {
            word: AtomicU32::new(live),
            live,
            what,
        }
    }

    /// `InvalidArgument` once destroyed; panics on an unknown tag.
    pub(crate) fn state(&self) -> Result<SigState> {
        let word = self.word.load(Ordering::Acquire);
        if word == self.live {
            Ok(SigState::Live)
        } else if word == SIG_STATIC {
            Ok(SigState::Static)
        } else if word == SIG_DESTROYED {
            Err(Error::InvalidArgument("destroyed object"))
        } else {
            self.corrupted(word)
        }
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        match self.state()? {
            SigState::Live => Ok(()),
            SigState::Static => Err(Error::InvalidArgument("uninitialized object")),
        }
    }

    pub(crate) fn promote(&self) {
        let _ = self.word.compare_exchange(
            SIG_STATIC,
            self.live,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn retire(&self) {
        self.word.store(SIG_DESTROYED, Ordering::Release);
    }

    fn corrupted(&self, word: u32) -> ! {
        error!("{} signature corrupted: {word:#010x}", self.what);
        panic!("{} signature corrupted: {word:#010x}", self.what);
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.word.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_of_a_tag() {
        let sig = Signature::new_static(SIG_MUTEX, "mutex");
        assert_eq!(sig.state(), Ok(SigState::Static));
        assert!(sig.check_live().is_err());

        sig.promote();
        assert_eq!(sig.state(), Ok(SigState::Live));

        sig.retire();
        assert_eq!(sig.state(), Err(Error::InvalidArgument("destroyed object")));
        sig.promote();
        assert!(sig.state().is_err());
    }

    #[test]
    #[should_panic(expected = "signature corrupted")]
    fn unknown_tag_is_fatal() {
        let sig = Signature::new_live(SIG_COND, "condvar");
        sig.word.store(0x1234_5678, Ordering::Relaxed);
        let _ = sig.state();
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ObjectId::next(), ObjectId::next());
    }
}
