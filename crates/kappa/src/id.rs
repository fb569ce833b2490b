//! Registration identifiers.
//!
//! Every suspended continuation is keyed by an [`Id`] issued by the
//! dispatcher's allocator. Two values are reserved and never issued:
//! [`Id::INVALID`] marks an empty waiting-table slot, [`Id::WAKEUP`] tags
//! the dispatcher's internal wake-up event.

use std::fmt;

/// An opaque integer tag for a registration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Id(i64);

impl Id {
    /// The empty-slot sentinel.
    pub const INVALID: Id = Id(0);
    /// The internal wake-up registration.
    pub const WAKEUP: Id = Id(-1);

    /// Whether this is one of the reserved sentinel values.
    pub fn is_sentinel(self) -> bool {
        self == Id::INVALID || self == Id::WAKEUP
    }

    /// The next id after this one, skipping the reserved region
    /// `WAKEUP..=INVALID`. Rollover of a 64-bit counter is a theoretical
    /// concern only, but the skip handles it all the same.
    pub(crate) fn next(self) -> Id {
        let n = self.0.wrapping_add(1);
        if n <= 0 {
            Id(1)
        } else {
            Id(n)
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_from_invalid() {
        let mut id = Id::INVALID;
        for expected in 1..=5 {
            id = id.next();
            assert_eq!(id, Id(expected));
        }
    }

    #[test]
    fn issued_ids_are_never_sentinels() {
        let mut id = Id::INVALID;
        for _ in 0..100 {
            id = id.next();
            assert!(!id.is_sentinel(), "allocator issued sentinel {}", id);
        }
    }

    #[test]
    fn wraparound_skips_reserved_region() {
        // i64::MAX wraps to i64::MIN; the allocator must land on 1.
        assert_eq!(Id(i64::MAX).next(), Id(1));
        assert_eq!(Id::WAKEUP.next(), Id(1));
        assert_eq!(Id(-2).next(), Id(1));
    }
}
