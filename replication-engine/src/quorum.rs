//! When enough replicas have answered.
//!
//! [`QuorumPolicy`] is a pure predicate over the counters in [`MetaData`]. One
//! policy is built for writes (PUT, DELETE, REPLICATE) and one for reads.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::message::MetaData;

/// Sleep between checks in [`QuorumPolicy::wait_quorum`].
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumKind {
    Writes,
    Reads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    kind: QuorumKind,
    required: usize,
    preferred: usize,
    required_zones: usize,
}

impl QuorumPolicy {
    pub fn new(kind: QuorumKind, required: usize, preferred: usize, required_zones: usize) -> Self {
        Self {
            kind,
            required,
            preferred: preferred.max(required),
            required_zones,
        }
    }

    pub fn writes(config: &EngineConfig) -> Self {
        Self::new(
            QuorumKind::Writes,
            config.required_writes,
            config.preferred_writes,
            config.required_zones,
        )
    }

    pub fn reads(config: &EngineConfig) -> Self {
        Self::new(
            QuorumKind::Reads,
            config.required_reads,
            config.preferred_reads,
            config.required_zones,
        )
    }

    pub fn kind(&self) -> QuorumKind {
        self.kind
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn preferred(&self) -> usize {
        self.preferred
    }

    pub fn required_zones(&self) -> usize {
        self.required_zones
    }

    /// The acknowledgement counter this policy reads.
    pub fn successes(&self, meta: &MetaData) -> usize {
        match self.kind {
            QuorumKind::Writes => meta.write_successes() + meta.replicate_successes,
            QuorumKind::Reads => meta.get_successes,
        }
    }

    pub fn is_quorum_satisfied(&self, meta: &MetaData) -> bool {
        self.successes(meta) >= self.required
    }

    /// Distinct zones must exceed `required_zones`; the local zone is the
    /// first. A zero requirement disables the check.
    pub fn is_zones_satisfied(&self, meta: &MetaData) -> bool {
        self.required_zones == 0 || meta.zones.len() > self.required_zones
    }

    pub fn is_preferred_reached(&self, meta: &MetaData) -> bool {
        self.successes(meta) >= self.preferred
    }

    pub fn is_satisfied(&self, meta: &MetaData) -> bool {
        self.is_quorum_satisfied(meta) && self.is_zones_satisfied(meta)
    }

    /// Polls `meta` until the quorum and zone checks both hold or `deadline`
    /// passes.
    ///
    /// Kept for callers that mutate a shared `MetaData` from several threads.
    /// The replicate path waits on its response channel instead.
    pub fn wait_quorum(&self, meta: &Mutex<MetaData>, deadline: Instant) -> bool {
        loop {
            if self.is_satisfied(&meta.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn meta(successes: usize, zones: &[u16]) -> MetaData {
        let mut meta = MetaData::new(None);
        meta.put_successes = successes;
        meta.zones = zones.iter().copied().collect();
        meta
    }

    #[test]
    fn quorum_counts_write_acknowledgements() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 2, 3, 0);
        assert!(!policy.is_quorum_satisfied(&meta(1, &[0])));
        assert!(policy.is_quorum_satisfied(&meta(2, &[0])));
        assert!(!policy.is_preferred_reached(&meta(2, &[0])));
        assert!(policy.is_preferred_reached(&meta(3, &[0])));
    }

    #[test]
    fn reads_count_get_successes_only() {
        let policy = QuorumPolicy::new(QuorumKind::Reads, 2, 2, 0);
        let mut m = meta(5, &[0]);
        assert!(!policy.is_quorum_satisfied(&m));
        m.get_successes = 2;
        assert!(policy.is_quorum_satisfied(&m));
    }

    #[test]
    fn zero_required_zones_disables_the_check() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 1, 1, 0);
        assert!(policy.is_zones_satisfied(&meta(1, &[])));
    }

    #[test]
    fn zones_must_exceed_requirement() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 1, 1, 1);
        assert!(!policy.is_zones_satisfied(&meta(3, &[0])));
        assert!(policy.is_zones_satisfied(&meta(3, &[0, 1])));
        assert!(!policy.is_satisfied(&meta(3, &[0])));
    }

    #[test]
    fn preferred_never_drops_below_required() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 3, 1, 0);
        assert_eq!(policy.preferred(), 3);
    }

    #[test]
    fn wait_quorum_sees_concurrent_progress() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 2, 2, 0);
        let shared = Arc::new(Mutex::new(meta(1, &[0])));
        let writer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                shared.lock().put_successes += 1;
            })
        };
        assert!(policy.wait_quorum(&shared, Instant::now() + Duration::from_secs(2)));
        writer.join().expect("writer thread");
    }

    #[test]
    fn wait_quorum_gives_up_at_deadline() {
        let policy = QuorumPolicy::new(QuorumKind::Writes, 2, 2, 0);
        let shared = Mutex::new(meta(1, &[0]));
        let started = Instant::now();
        assert!(!policy.wait_quorum(&shared, started + Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
