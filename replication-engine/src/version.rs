//! Logical versions and their partial order.
//!
//! A [`Version`] maps replica identifiers to counters. Two versions are
//! compared entry by entry (missing entries count as zero) and the result is
//! one of the four [`VersionOrder`] verdicts. The wall-clock timestamp carried
//! alongside the counters is informational only and never takes part in a
//! comparison.
//!
//! The module also defines [`HybridTimestamp`], the packed counter produced by
//! the Lamport-style clock: the logical counter lives in the high bits and the
//! originating node id in the low [`NODE_ID_BITS`] bits, so two nodes whose
//! logical counters collide still produce distinct, totally ordered values.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a replica (a storage node).
pub type NodeId = u16;

/// Number of low-order bits a [`HybridTimestamp`] reserves for the node id.
pub const NODE_ID_BITS: u32 = 16;

const NODE_ID_MASK: u64 = (1 << NODE_ID_BITS) - 1;

/// Largest logical counter a [`HybridTimestamp`] can carry.
pub const MAX_LOGICAL: u64 = u64::MAX >> NODE_ID_BITS;

/// Verdict of comparing two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOrder {
    /// Every counter is less than or equal, at least one strictly less.
    Before,
    /// Every counter is greater than or equal, at least one strictly greater.
    After,
    /// Neither side dominates: a true causal conflict.
    Concurrent,
    /// Identical on all known node identifiers.
    Tie,
}

impl VersionOrder {
    /// The verdict seen from the other side of the comparison.
    pub fn reverse(self) -> Self {
        match self {
            VersionOrder::Before => VersionOrder::After,
            VersionOrder::After => VersionOrder::Before,
            other => other,
        }
    }
}

/// Per-key logical timestamp: node id -> monotonically non-decreasing counter.
///
/// Versions are values. Every update (`merge`, `updated`, `incremented`)
/// returns a new `Version`, so a version attached to a stored record is never
/// changed underneath it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    entries: BTreeMap<NodeId, u64>,
    /// Milliseconds since the Unix epoch of the last update. Diagnostics only.
    #[serde(default)]
    timestamp_ms: u64,
}

impl Version {
    /// The bottom of the lattice: no entries, before everything non-empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a version from `(node, counter)` pairs. Zero counters are dropped.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, u64)>,
    {
        let mut version = Self::new();
        for (node, counter) in entries {
            if counter > 0 {
                let slot = version.entries.entry(node).or_insert(0);
                *slot = (*slot).max(counter);
            }
        }
        version.timestamp_ms = now_ms();
        version
    }

    pub fn counter(&self, node: NodeId) -> u64 {
        self.entries.get(&node).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.entries.iter().map(|(node, counter)| (*node, *counter))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Compares two versions by their counters alone.
    pub fn compare(&self, other: &Version) -> VersionOrder {
        let mut self_bigger = false;
        let mut other_bigger = false;

        let nodes = self.entries.keys().chain(other.entries.keys());
        for node in nodes {
            let mine = self.counter(*node);
            let theirs = other.counter(*node);
            if mine > theirs {
                self_bigger = true;
            } else if theirs > mine {
                other_bigger = true;
            }
            if self_bigger && other_bigger {
                return VersionOrder::Concurrent;
            }
        }

        match (self_bigger, other_bigger) {
            (false, false) => VersionOrder::Tie,
            (true, false) => VersionOrder::After,
            (false, true) => VersionOrder::Before,
            (true, true) => VersionOrder::Concurrent,
        }
    }

    /// Per-node maximum of both versions.
    pub fn merge(&self, other: &Version) -> Version {
        let mut entries = self.entries.clone();
        for (node, counter) in &other.entries {
            let slot = entries.entry(*node).or_insert(0);
            *slot = (*slot).max(*counter);
        }
        Version {
            entries,
            timestamp_ms: self.timestamp_ms.max(other.timestamp_ms),
        }
    }

    /// Folds one observed `(node, counter)` pair into a copy of this version.
    ///
    /// The entry never decreases: an observation older than what is already
    /// known leaves the counter untouched.
    pub fn updated(&self, node: NodeId, counter: u64, observed_at_ms: u64) -> Version {
        let mut entries = self.entries.clone();
        let slot = entries.entry(node).or_insert(0);
        *slot = (*slot).max(counter);
        Version {
            entries,
            timestamp_ms: self.timestamp_ms.max(observed_at_ms),
        }
    }

    /// A copy with `node`'s counter advanced by one.
    pub fn incremented(&self, node: NodeId, now_ms: u64) -> Version {
        let mut entries = self.entries.clone();
        *entries.entry(node).or_insert(0) += 1;
        Version {
            entries,
            timestamp_ms: now_ms,
        }
    }

    /// True when this version already reflects `required`, i.e. `required`
    /// compares `Before` or `Tie` against it.
    pub fn satisfies(&self, required: &Version) -> bool {
        matches!(
            required.compare(self),
            VersionOrder::Before | VersionOrder::Tie
        )
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == VersionOrder::Tie
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (node, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "n{node}:{counter}")?;
        }
        f.write_str("}")
    }
}

/// Compares two possibly-missing versions. A missing version is the bottom of
/// the lattice: strictly before any non-empty version and tied with another
/// missing one.
pub fn compare_optional(a: Option<&Version>, b: Option<&Version>) -> VersionOrder {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(b),
        (None, Some(b)) if b.is_empty() => VersionOrder::Tie,
        (None, Some(_)) => VersionOrder::Before,
        (Some(a), None) if a.is_empty() => VersionOrder::Tie,
        (Some(_), None) => VersionOrder::After,
        (None, None) => VersionOrder::Tie,
    }
}

/// A value (or tombstone) together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    /// `None` marks a delete.
    pub value: Option<Vec<u8>>,
    pub version: Version,
}

impl Versioned {
    pub fn new(value: Option<Vec<u8>>, version: Version) -> Self {
        Self { value, version }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Lamport counter and node id packed into one integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    /// Packs `logical` and `node`, or `None` when `logical` does not fit
    /// above the node id bits.
    pub fn try_pack(logical: u64, node: NodeId) -> Option<Self> {
        if logical > MAX_LOGICAL {
            return None;
        }
        let shifted = logical.checked_shl(NODE_ID_BITS)?;
        Some(Self(shifted | u64::from(node)))
    }

    /// Like [`try_pack`](Self::try_pack) but saturates at [`MAX_LOGICAL`]
    /// instead of wrapping.
    pub fn pack(logical: u64, node: NodeId) -> Self {
        Self::try_pack(logical.min(MAX_LOGICAL), node).unwrap_or(Self(u64::MAX))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn logical(self) -> u64 {
        self.0 >> NODE_ID_BITS
    }

    pub fn node(self) -> NodeId {
        (self.0 & NODE_ID_MASK) as NodeId
    }
}

/// Milliseconds since the Unix epoch, saturating to zero on a clock before 1970.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(entries: &[(NodeId, u64)]) -> Version {
        Version::from_entries(entries.iter().copied())
    }

    #[test]
    fn compare_covers_all_verdicts() {
        assert_eq!(v(&[(0, 1)]).compare(&v(&[(0, 2)])), VersionOrder::Before);
        assert_eq!(v(&[(0, 2)]).compare(&v(&[(0, 1)])), VersionOrder::After);
        assert_eq!(
            v(&[(0, 2), (1, 1)]).compare(&v(&[(0, 1), (1, 2)])),
            VersionOrder::Concurrent
        );
        assert_eq!(v(&[(0, 3), (1, 1)]).compare(&v(&[(1, 1), (0, 3)])), VersionOrder::Tie);
    }

    #[test]
    fn missing_entries_count_as_zero() {
        assert_eq!(v(&[(0, 1)]).compare(&v(&[(0, 1), (1, 1)])), VersionOrder::Before);
        assert_eq!(v(&[(0, 0)]).compare(&Version::new()), VersionOrder::Tie);
    }

    #[test]
    fn wall_clock_does_not_affect_order() {
        let a = Version::new().updated(0, 4, 10);
        let b = Version::new().updated(0, 4, 99_999);
        assert_eq!(a.compare(&b), VersionOrder::Tie);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_version_is_bottom() {
        let some = v(&[(2, 1)]);
        assert_eq!(compare_optional(None, Some(&some)), VersionOrder::Before);
        assert_eq!(compare_optional(Some(&some), None), VersionOrder::After);
        assert_eq!(compare_optional(None, None), VersionOrder::Tie);
    }

    #[test]
    fn merge_takes_per_node_maximum() {
        let merged = v(&[(0, 3), (1, 1)]).merge(&v(&[(1, 4), (2, 2)]));
        assert_eq!(merged, v(&[(0, 3), (1, 4), (2, 2)]));
    }

    #[test]
    fn updated_never_decreases_a_counter() {
        let base = v(&[(0, 7)]);
        assert_eq!(base.updated(0, 3, 0).counter(0), 7);
        assert_eq!(base.updated(0, 9, 0).counter(0), 9);
    }

    #[test]
    fn satisfies_accepts_equal_or_newer() {
        let durable = v(&[(0, 5)]);
        assert!(durable.satisfies(&v(&[(0, 5)])));
        assert!(durable.satisfies(&v(&[(0, 4)])));
        assert!(!durable.satisfies(&v(&[(0, 6)])));
        assert!(!durable.satisfies(&v(&[(1, 1)])));
    }

    #[test]
    fn hybrid_timestamp_round_trips_fields() {
        let ts = HybridTimestamp::pack(42, 7);
        assert_eq!(ts.logical(), 42);
        assert_eq!(ts.node(), 7);
        // Equal logical counters are ordered by node id.
        assert!(HybridTimestamp::pack(42, 3) < HybridTimestamp::pack(42, 9));
        assert!(HybridTimestamp::pack(41, 9) < HybridTimestamp::pack(42, 0));
    }

    #[test]
    fn oversized_logical_counter_does_not_wrap() {
        assert_eq!(HybridTimestamp::try_pack(MAX_LOGICAL + 1, 0), None);
        let top = HybridTimestamp::try_pack(MAX_LOGICAL, 3).expect("largest counter fits");
        assert_eq!(top.logical(), MAX_LOGICAL);
        assert_eq!(top.node(), 3);

        let saturated = HybridTimestamp::pack(MAX_LOGICAL + 5, 3);
        assert_eq!(saturated, top);
        assert!(saturated > HybridTimestamp::pack(1, 3));
    }

    #[test]
    fn display_lists_entries() {
        assert_eq!(v(&[(1, 2), (0, 3)]).to_string(), "{n0:3, n1:2}");
    }
}
