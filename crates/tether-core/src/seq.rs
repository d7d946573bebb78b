//! 32-bit wrapping sequence numbers.
//!
//! Sequence numbers advance by payload length and wrap at 2^32. Two values
//! are ordered by the sign of their wrapping difference, so a value that has
//! just wrapped past `u32::MAX` still ranks after its predecessor. This is
//! the usual serial-number arithmetic; it is only meaningful while the two
//! values are less than 2^31 apart.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A wrapping 32-bit sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Seq(u32);

impl Seq {
    /// Sequence number zero
    pub const ZERO: Self = Self(0);

    /// Wrap a raw value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Advance by `n` units, wrapping at 2^32
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn add(self, n: usize) -> Self {
        // Only the low 32 bits of the length matter modulo 2^32.
        Self(self.0.wrapping_add(n as u32))
    }

    /// Signed distance from `self` to `other` (positive when `other` is after)
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn distance_to(self, other: Self) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// Wraparound-aware ordering
    #[must_use]
    pub const fn wrapping_cmp(self, other: Self) -> Ordering {
        let d = other.distance_to(self);
        if d < 0 {
            Ordering::Less
        } else if d > 0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// True when `self` comes strictly after `other`
    #[must_use]
    pub const fn is_after(self, other: Self) -> bool {
        matches!(self.wrapping_cmp(other), Ordering::Greater)
    }

    /// True when `self` comes strictly before `other`
    #[must_use]
    pub const fn is_before(self, other: Self) -> bool {
        matches!(self.wrapping_cmp(other), Ordering::Less)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound sequence allocator
///
/// Each call to [`SeqCounter::advance`] returns the number to stamp on the
/// packet being sent and moves the counter past its payload.
#[derive(Debug, Clone, Copy)]
pub struct SeqCounter {
    next: Seq,
}

impl SeqCounter {
    /// Start counting from `initial`
    #[must_use]
    pub const fn new(initial: Seq) -> Self {
        Self { next: initial }
    }

    /// Start from a random initial sequence number
    #[must_use]
    pub fn random() -> Self {
        Self::new(Seq::new(rand::random()))
    }

    /// The sequence number the next packet will carry
    #[must_use]
    pub const fn peek(&self) -> Seq {
        self.next
    }

    /// Allocate `len` units and return the sequence number before the advance
    pub fn advance(&mut self, len: usize) -> Seq {
        let seq = self.next;
        self.next = self.next.add(len);
        if len != 0 {
            tracing::trace!("sequence advanced to {}", self.next);
        }
        seq
    }
}
