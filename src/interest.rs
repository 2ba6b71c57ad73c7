//! Interest masks for endpoint registrations.
//!
//! An [`Interest`] is a small bit set over the four operations an endpoint
//! can be waited on for: read, write, accept and connect. The same type is
//! used both as the registration's interest mask and as the per-event
//! readiness set handed to dispatch.

use std::fmt;
use std::ops;

/// A set of endpoint operations.
///
/// Combine values with `|`:
///
/// ```
/// use spindle::Interest;
///
/// let mask = Interest::READ | Interest::WRITE;
/// assert!(mask.contains(Interest::READ));
/// assert!(!mask.contains(Interest::CONNECT));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const ACCEPT: u8 = 0b0100;
const CONNECT: u8 = 0b1000;

impl Interest {
    /// Readiness to read from the endpoint.
    pub const READ: Interest = Interest(READ);

    /// Readiness to write to the endpoint.
    pub const WRITE: Interest = Interest(WRITE);

    /// Readiness to accept an inbound connection.
    pub const ACCEPT: Interest = Interest(ACCEPT);

    /// Completion of an outbound connection attempt.
    pub const CONNECT: Interest = Interest(CONNECT);

    /// The empty set.
    pub const fn empty() -> Interest {
        Interest(0)
    }

    /// All four operations.
    pub const fn all() -> Interest {
        Interest(READ | WRITE | ACCEPT | CONNECT)
    }

    /// Set union. Same as `|`, but usable in `const` position.
    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Removes `other` from the set.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Set intersection.
    pub const fn intersection(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    /// Returns true if every operation in `other` is present in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `self` and `other` share at least one operation.
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if no operation is present.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.union(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        *self = self.union(other);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }

        let mut flagged = false;
        for (bit, name) in [
            (Interest::READ, "READ"),
            (Interest::WRITE, "WRITE"),
            (Interest::ACCEPT, "ACCEPT"),
            (Interest::CONNECT, "CONNECT"),
        ] {
            if self.contains(bit) {
                if flagged {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{name}")?;
                flagged = true;
            }
        }

        Ok(())
    }
}
