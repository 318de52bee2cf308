//! In-memory multi-version storage.
//!
//! Each key holds a list of sibling [`Versioned`] values whose versions are
//! pairwise concurrent. A write replaces every sibling it dominates and is
//! rejected as obsolete when an existing sibling dominates or equals it, so
//! re-applying a write is always harmless.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::communication::InternalCommunication;
use crate::error::ReplicaError;
use crate::message::Key;
use crate::version::{NodeId, VersionOrder, Versioned};

#[derive(Default)]
pub struct MemoryStorage {
    node_id: NodeId,
    data: Mutex<BTreeMap<Key, Vec<Versioned>>>,
    /// Maximum number of distinct keys; writes of new keys beyond it fail
    /// with `QuotaExceeded`.
    key_quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            data: Mutex::new(BTreeMap::new()),
            key_quota: None,
        }
    }

    pub fn with_key_quota(node_id: NodeId, key_quota: usize) -> Self {
        Self {
            key_quota: Some(key_quota),
            ..Self::new(node_id)
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl InternalCommunication for MemoryStorage {
    fn get(&self, key: &str) -> Result<Vec<Versioned>, ReplicaError> {
        Ok(self.data.lock().get(key).cloned().unwrap_or_default())
    }

    fn put(&self, key: &str, versioned: Versioned) -> Result<(), ReplicaError> {
        let mut data = self.data.lock();

        if let Some(quota) = self.key_quota {
            if !data.contains_key(key) && data.len() >= quota {
                return Err(ReplicaError::QuotaExceeded { node: self.node_id });
            }
        }

        let siblings = data.entry(key.to_string()).or_default();
        let obsolete = siblings.iter().any(|existing| {
            matches!(
                versioned.version.compare(&existing.version),
                VersionOrder::Before | VersionOrder::Tie
            )
        });
        if obsolete {
            return Err(ReplicaError::ObsoleteVersion {
                key: key.to_string(),
            });
        }

        siblings.retain(|existing| {
            versioned.version.compare(&existing.version) != VersionOrder::After
        });
        siblings.push(versioned);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn write(value: &str, entries: &[(NodeId, u64)]) -> Versioned {
        Versioned::new(
            Some(value.as_bytes().to_vec()),
            Version::from_entries(entries.iter().copied()),
        )
    }

    #[test]
    fn newer_write_replaces_older() {
        let storage = MemoryStorage::new(0);
        storage.put("k", write("a", &[(0, 1)])).expect("first put");
        storage.put("k", write("b", &[(0, 2)])).expect("second put");
        let stored = storage.get("k").expect("get");
        assert_eq!(stored, vec![write("b", &[(0, 2)])]);
    }

    #[test]
    fn older_or_equal_write_is_obsolete() {
        let storage = MemoryStorage::new(0);
        storage.put("k", write("a", &[(0, 3)])).expect("put");
        assert!(matches!(
            storage.put("k", write("b", &[(0, 2)])),
            Err(ReplicaError::ObsoleteVersion { .. })
        ));
        assert!(matches!(
            storage.put("k", write("a", &[(0, 3)])),
            Err(ReplicaError::ObsoleteVersion { .. })
        ));
        assert_eq!(storage.get("k").expect("get"), vec![write("a", &[(0, 3)])]);
    }

    #[test]
    fn concurrent_writes_become_siblings() {
        let storage = MemoryStorage::new(0);
        storage.put("k", write("a", &[(0, 1)])).expect("put a");
        storage.put("k", write("b", &[(1, 1)])).expect("put b");
        assert_eq!(storage.get("k").expect("get").len(), 2);
        assert_eq!(
            storage.durable_version("k").expect("durable"),
            Some(Version::from_entries([(0, 1), (1, 1)]))
        );

        // A write that saw both siblings collapses them.
        storage
            .put("k", write("c", &[(0, 1), (1, 2)]))
            .expect("put c");
        assert_eq!(
            storage.get("k").expect("get"),
            vec![write("c", &[(0, 1), (1, 2)])]
        );
    }

    #[test]
    fn unknown_key_has_no_durable_version() {
        let storage = MemoryStorage::new(0);
        assert_eq!(storage.get("missing").expect("get"), vec![]);
        assert_eq!(storage.durable_version("missing").expect("durable"), None);
    }

    #[test]
    fn quota_rejects_new_keys_only() {
        let storage = MemoryStorage::with_key_quota(4, 1);
        storage.put("a", write("x", &[(0, 1)])).expect("first key");
        storage.put("a", write("y", &[(0, 2)])).expect("same key");
        assert_eq!(
            storage.put("b", write("z", &[(0, 1)])),
            Err(ReplicaError::QuotaExceeded { node: 4 })
        );
    }
}
