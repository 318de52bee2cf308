//! Timestamping and the process-local causal clock.
//!
//! Two interchangeable clocks implement [`Order`]:
//!
//! - [`LamportOrder`] keeps a single logical counter and stamps writes with a
//!   [`HybridTimestamp`] (counter in the high bits, node id in the low bits).
//!   Observing a remote version bumps the counter past everything seen, the
//!   classic `max(local, received) + 1` rule. Used by the causal variant.
//! - [`VectorOrder`] keeps a vector clock and stamps writes by advancing this
//!   node's entry. Used by the quorum variant.
//!
//! In both cases the new version is layered on top of the key's durable
//! version, so a write dominates everything its issuer has already seen for
//! that key.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::message::Content;
use crate::version::{HybridTimestamp, MAX_LOGICAL, NodeId, Version, VersionOrder, now_ms};

/// Assigns versions to local writes and tracks causality observed from peers.
pub trait Order: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Advances the local clock and returns the version for a new local write
    /// of `content`, whose key currently sits at `durable`.
    fn time_stamping(&self, content: &Content, durable: Option<&Version>, started_at_ms: u64)
        -> Version;

    /// Folds a remotely produced version into the local clock so that later
    /// local writes causally follow it.
    fn update_clock(&self, observed: &Version);

    fn compare_messages(&self, a: &Version, b: &Version) -> VersionOrder {
        a.compare(b)
    }

    /// Snapshot of the local clock.
    fn current(&self) -> Version;
}

pub struct LamportOrder {
    node_id: NodeId,
    logical: AtomicU64,
}

impl LamportOrder {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            logical: AtomicU64::new(0),
        }
    }

    /// One local tick. Returns the packed timestamp for the new event.
    ///
    /// The counter stops at [`MAX_LOGICAL`]; once there, every tick returns
    /// the same stamp.
    pub fn tick(&self) -> HybridTimestamp {
        let advanced = self
            .logical
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |local| {
                (local < MAX_LOGICAL).then(|| local + 1)
            });
        match advanced {
            Ok(previous) => HybridTimestamp::pack(previous + 1, self.node_id),
            Err(_) => {
                warn!(node = self.node_id, "logical clock exhausted");
                HybridTimestamp::pack(MAX_LOGICAL, self.node_id)
            }
        }
    }

    /// Bumps the counter past `observed`: `max(local, observed) + 1`.
    ///
    /// Returns false, leaving the clock alone, when `observed` is so large
    /// that no local stamp could follow it.
    fn observe(&self, observed: HybridTimestamp) -> bool {
        let remote = observed.logical();
        if remote >= MAX_LOGICAL {
            warn!(
                node = self.node_id,
                remote,
                "ignoring remote timestamp at the top of the clock range"
            );
            return false;
        }
        let _ = self
            .logical
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |local| {
                Some((local.max(remote) + 1).min(MAX_LOGICAL))
            });
        true
    }

    pub fn logical(&self) -> u64 {
        self.logical.load(Ordering::Acquire)
    }
}

impl Order for LamportOrder {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn time_stamping(
        &self,
        _content: &Content,
        durable: Option<&Version>,
        started_at_ms: u64,
    ) -> Version {
        if let Some(durable) = durable {
            // Writes to a key always follow what the key already holds, even
            // when the durable version came from a node this clock has not
            // heard from directly.
            self.update_clock(durable);
        }
        let stamp = self.tick();
        durable
            .cloned()
            .unwrap_or_default()
            .updated(self.node_id, stamp.raw(), started_at_ms)
    }

    fn update_clock(&self, observed: &Version) {
        for (_, counter) in observed.entries() {
            let _ = self.observe(HybridTimestamp::from_raw(counter));
        }
    }

    fn current(&self) -> Version {
        let now = HybridTimestamp::pack(self.logical(), self.node_id);
        Version::new().updated(self.node_id, now.raw(), now_ms())
    }
}

pub struct VectorOrder {
    node_id: NodeId,
    clock: Mutex<Version>,
}

impl VectorOrder {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            clock: Mutex::new(Version::new()),
        }
    }
}

impl Order for VectorOrder {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn time_stamping(
        &self,
        _content: &Content,
        durable: Option<&Version>,
        started_at_ms: u64,
    ) -> Version {
        let base = durable.cloned().unwrap_or_default();
        let mut clock = self.clock.lock();
        let next = clock.counter(self.node_id).max(base.counter(self.node_id)) + 1;
        *clock = clock.updated(self.node_id, next, started_at_ms);
        base.updated(self.node_id, next, started_at_ms)
    }

    fn update_clock(&self, observed: &Version) {
        let mut clock = self.clock.lock();
        *clock = clock.merge(observed);
    }

    fn current(&self) -> Version {
        self.clock.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> Content {
        Content::new("k", Some(b"v".to_vec()))
    }

    #[test]
    fn lamport_stamps_strictly_increase() {
        let order = LamportOrder::new(3);
        let mut last = 0;
        for _ in 0..100 {
            let version = order.time_stamping(&content(), None, 0);
            let counter = version.counter(3);
            assert!(counter > last);
            assert_eq!(HybridTimestamp::from_raw(counter).node(), 3);
            last = counter;
        }
    }

    #[test]
    fn lamport_clock_jumps_past_observed_versions() {
        let order = LamportOrder::new(1);
        let remote = HybridTimestamp::pack(500, 2);
        order.update_clock(&Version::from_entries([(2, remote.raw())]));
        assert_eq!(order.logical(), 501);

        let stamped = order.time_stamping(&content(), None, 0);
        assert!(HybridTimestamp::from_raw(stamped.counter(1)) > remote);
    }

    #[test]
    fn lamport_clock_ignores_stamps_it_cannot_follow() {
        let order = LamportOrder::new(1);
        let earlier = order.time_stamping(&content(), None, 0).counter(1);

        let top = HybridTimestamp::pack(MAX_LOGICAL, 0);
        assert!(!order.observe(top));
        order.update_clock(&Version::from_entries([(0, top.raw())]));

        let later = order.time_stamping(&content(), None, 0).counter(1);
        assert!(later > earlier, "{later} should follow {earlier}");
    }

    #[test]
    fn write_over_out_of_range_durable_version_still_dominates_it() {
        let order = LamportOrder::new(1);
        let durable = Version::from_entries([(0, HybridTimestamp::pack(MAX_LOGICAL, 0).raw())]);
        let stamped = order.time_stamping(&content(), Some(&durable), 0);
        assert_eq!(durable.compare(&stamped), VersionOrder::Before);
    }

    #[test]
    fn tick_saturates_instead_of_wrapping() {
        let order = LamportOrder::new(2);
        assert!(order.observe(HybridTimestamp::pack(MAX_LOGICAL - 1, 0)));
        assert_eq!(order.logical(), MAX_LOGICAL);

        let stamp = order.tick();
        assert_eq!(stamp.logical(), MAX_LOGICAL);
        assert_eq!(stamp.node(), 2);
        assert!(order.tick() >= stamp);
    }

    #[test]
    fn lamport_write_dominates_durable_version() {
        let order = LamportOrder::new(1);
        let durable = Version::from_entries([(0, HybridTimestamp::pack(40, 0).raw())]);
        let stamped = order.time_stamping(&content(), Some(&durable), 0);
        assert_eq!(durable.compare(&stamped), VersionOrder::Before);
    }

    #[test]
    fn vector_first_write_is_counter_one() {
        let order = VectorOrder::new(0);
        let stamped = order.time_stamping(&content(), None, 0);
        assert_eq!(stamped, Version::from_entries([(0, 1)]));
    }

    #[test]
    fn vector_stamps_follow_durable_and_clock() {
        let order = VectorOrder::new(0);
        let durable = Version::from_entries([(0, 4), (1, 2)]);
        let stamped = order.time_stamping(&content(), Some(&durable), 0);
        assert_eq!(stamped, Version::from_entries([(0, 5), (1, 2)]));

        // A later write to a fresh key still advances this node's counter.
        let fresh = order.time_stamping(&content(), None, 0);
        assert_eq!(fresh.counter(0), 6);
    }

    #[test]
    fn vector_update_merges_remote_entries() {
        let order = VectorOrder::new(0);
        order.update_clock(&Version::from_entries([(1, 7)]));
        order.update_clock(&Version::from_entries([(1, 3), (2, 1)]));
        assert_eq!(order.current(), Version::from_entries([(1, 7), (2, 1)]));
    }
}
