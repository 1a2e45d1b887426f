//! Vector-clock file versions.

use spindrift_types::bep;
use spindrift_types::ShortId;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    /// Identical histories.
    Equal,
    /// Self strictly dominates the other.
    Greater,
    /// The other strictly dominates self.
    Lesser,
    /// Neither dominates: concurrent edits, a potential conflict.
    Concurrent,
}

/// Per-device edit counters, ordered by first modification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version {
    counters: Vec<(ShortId, u64)>,
}

impl Version {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// A history with a single edit by `id`.
    pub fn initial(id: ShortId) -> Self {
        Self {
            counters: vec![(id, 1)],
        }
    }

    /// Record an edit by `id`.
    pub fn update(&mut self, id: ShortId) {
        match self.counters.iter_mut().find(|(i, _)| *i == id) {
            Some((_, v)) => *v += 1,
            None => self.counters.push((id, 1)),
        }
    }

    /// The counter for `id`, zero if the device never edited.
    pub fn counter(&self, id: ShortId) -> u64 {
        self.counters
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// True if no edits are recorded.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Compare against another history.
    pub fn compare(&self, other: &Self) -> Dominance {
        let mut greater = false;
        let mut lesser = false;
        for (id, v) in &self.counters {
            match other.counter(*id).cmp(v) {
                std::cmp::Ordering::Less => greater = true,
                std::cmp::Ordering::Greater => lesser = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        for (id, v) in &other.counters {
            if self.counter(*id) < *v {
                lesser = true;
            }
        }
        match (greater, lesser) {
            (false, false) => Dominance::Equal,
            (true, false) => Dominance::Greater,
            (false, true) => Dominance::Lesser,
            (true, true) => Dominance::Concurrent,
        }
    }

    /// Build from the wire representation.
    pub fn from_wire(vector: &bep::Vector) -> Self {
        Self {
            counters: vector.counters.iter().map(|c| (c.id, c.value)).collect(),
        }
    }

    /// Convert to the wire representation.
    pub fn to_wire(&self) -> bep::Vector {
        bep::Vector {
            counters: self
                .counters
                .iter()
                .map(|(id, value)| bep::Counter {
                    id: *id,
                    value: *value,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_increments_and_appends() {
        let mut v = Version::new();
        v.update(1);
        v.update(1);
        v.update(2);
        assert_eq!(v.counter(1), 2);
        assert_eq!(v.counter(2), 1);
        assert_eq!(v.counter(3), 0);
    }

    #[test]
    fn equal_histories_compare_equal() {
        let mut a = Version::new();
        a.update(1);
        a.update(2);
        let mut b = Version::new();
        b.update(2);
        b.update(1);
        assert_eq!(a.compare(&b), Dominance::Equal);
    }

    #[test]
    fn strict_dominance() {
        let mut a = Version::initial(1);
        let b = a.clone();
        a.update(1);
        assert_eq!(a.compare(&b), Dominance::Greater);
        assert_eq!(b.compare(&a), Dominance::Lesser);
    }

    #[test]
    fn concurrent_edits_are_incomparable() {
        let base = Version::initial(1);
        let mut a = base.clone();
        a.update(2);
        let mut b = base;
        b.update(3);
        assert_eq!(a.compare(&b), Dominance::Concurrent);
        assert_eq!(b.compare(&a), Dominance::Concurrent);
    }

    #[test]
    fn empty_is_dominated_by_anything() {
        let empty = Version::new();
        let edited = Version::initial(7);
        assert_eq!(empty.compare(&edited), Dominance::Lesser);
        assert_eq!(edited.compare(&empty), Dominance::Greater);
        assert_eq!(empty.compare(&Version::new()), Dominance::Equal);
    }

    #[test]
    fn wire_roundtrip() {
        let mut v = Version::new();
        v.update(10);
        v.update(20);
        v.update(10);
        let restored = Version::from_wire(&v.to_wire());
        assert_eq!(v, restored);
    }
}
