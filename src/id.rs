// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Identifier algebra for the struct log.
//!
//! Every unit of content ever produced is named by an `Id`: the client that
//! produced it and that client's clock at the time. Clocks count units, not
//! operations, so an item carrying five characters occupies five consecutive
//! clock values. A struct spanning `[clock, clock + len)` is addressed by the
//! `Id` of its first unit.
//!
//! Ids are totally ordered by `(client, clock)` for tie-breaking only; the
//! causal order between ids of different clients is partial.

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;

/// A process-local client identifier: a random positive integer drawn once
/// per document instance.
pub type ClientId = u64;

/// The unique name of a single unit of content, for all time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// The client that produced this unit.
    pub client: ClientId,
    /// The number of units the client had produced before this one.
    pub clock: u32,
}

impl Id {
    /// Create a new id.
    pub fn new(client: ClientId, clock: u32) -> Id {
        return Id { client, clock };
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.client.cmp(&other.client) {
            Ordering::Equal => self.clock.cmp(&other.clock),
            other => other,
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}:{}", self.client, self.clock);
    }
}

/// A half-open interval `[clock, clock + len)` within one client's log.
///
/// Ranges are the unit of the delete set: they never name a client
/// themselves, the surrounding map does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First clock covered by the range.
    pub clock: u32,
    /// Number of units covered.
    pub len: u32,
}

impl IdRange {
    /// Create a new range.
    pub fn new(clock: u32, len: u32) -> IdRange {
        return IdRange { clock, len };
    }

    /// One past the last clock covered.
    pub fn end(&self) -> u32 {
        return self.clock + self.len;
    }

    /// Check whether a clock falls inside the range.
    pub fn contains(&self, clock: u32) -> bool {
        return clock >= self.clock && clock < self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ordering_by_client_then_clock() {
        let a = Id::new(1, 5);
        let b = Id::new(1, 6);
        let c = Id::new(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn id_equality() {
        assert_eq!(Id::new(3, 7), Id::new(3, 7));
        assert_ne!(Id::new(3, 7), Id::new(3, 8));
        assert_ne!(Id::new(3, 7), Id::new(4, 7));
    }

    #[test]
    fn range_contains_is_half_open() {
        let range = IdRange::new(10, 5);

        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(14));
        assert!(!range.contains(15));
    }

    #[test]
    fn range_end() {
        assert_eq!(IdRange::new(0, 3).end(), 3);
        assert_eq!(IdRange::new(7, 1).end(), 8);
    }
}
