//! Coordination primitive with ready/not-ready state.
//!
//! A [`Semaphore`] is a cheap handle (`Rc` inside) with identity semantics:
//! equality, ordering and hashing all go by the id supplied at
//! construction, which the dispatcher draws from its registration-id
//! allocator. The counter itself is a plain `Cell` — the dispatcher is
//! single-threaded by design.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::id::Id;

pub struct Semaphore {
    inner: Rc<SemInner>,
}

struct SemInner {
    id: Id,
    count: Cell<i64>,
}

impl Semaphore {
    pub(crate) fn new(id: Id) -> Self {
        Semaphore {
            inner: Rc::new(SemInner {
                id,
                count: Cell::new(0),
            }),
        }
    }

    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Make one more unit available.
    pub fn signal(&self) {
        let count = &self.inner.count;
        count.set(count.get() + 1);
    }

    /// Try to consume one unit. Returns whether a unit was taken.
    pub fn wait(&self) -> bool {
        let count = &self.inner.count;
        if count.get() > 0 {
            count.set(count.get() - 1);
            true
        } else {
            false
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.count.get() > 0
    }

    /// Run `body` only if the semaphore is ready. The readiness check and
    /// the body form the critical section the dispatcher's signal/wait
    /// pairing relies on; `body` itself does not consume a unit.
    pub fn with_ready<R>(&self, body: impl FnOnce() -> R) -> Option<R> {
        if self.is_ready() {
            Some(body())
        } else {
            None
        }
    }
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Semaphore {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Semaphore {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Semaphore {}

impl PartialOrd for Semaphore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Semaphore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.id.cmp(&other.inner.id)
    }
}

impl Hash for Semaphore {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.inner.id)
            .field("count", &self.inner.count.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sem() -> Semaphore {
        Semaphore::new(Id::INVALID.next())
    }

    #[test]
    fn signal_makes_ready_wait_consumes() {
        let s = sem();
        assert!(!s.is_ready());
        s.signal();
        assert!(s.is_ready());
        assert!(s.wait());
        assert!(!s.is_ready());
        assert!(!s.wait());
    }

    #[test]
    fn with_ready_runs_only_when_ready() {
        let s = sem();
        assert_eq!(s.with_ready(|| 7), None);
        s.signal();
        assert_eq!(s.with_ready(|| 7), Some(7));
        // Non-consuming: still ready afterwards.
        assert!(s.is_ready());
    }

    #[test]
    fn identity_follows_id_not_handle() {
        let a = Semaphore::new(Id::INVALID.next());
        let b = a.clone();
        let c = Semaphore::new(Id::INVALID.next().next());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }
}
