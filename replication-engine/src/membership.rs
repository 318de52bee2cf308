//! Cluster membership: who replicates which key, and who may timestamp it.
//!
//! The core only consumes [`GroupMembership`]. [`StaticMembership`] answers
//! from a fixed [`ClusterConfig`], routing keys to partitions with a seeded
//! xxHash so every node computes the same placement.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;
use twox_hash::XxHash64;

use crate::config::{ClusterConfig, PartitionConfig, TimestamperPolicy};
use crate::message::ZoneId;
use crate::version::NodeId;

pub type PartitionId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub zone: ZoneId,
    pub address: String,
}

/// What this node may do for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authorized to assign the initial version of a write.
    Timestamper,
    /// Hosts the key but must not timestamp it.
    Replica,
    /// Does not host the key.
    Foreign,
}

pub trait GroupMembership: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn zone_id(&self) -> ZoneId;

    /// The first partition this node hosts.
    fn partition_id(&self) -> PartitionId;

    fn find_partition(&self, key: &str) -> PartitionId;

    fn hosts(&self, partition: PartitionId) -> bool;

    fn node(&self, id: NodeId) -> Option<NodeInfo>;

    /// Replicas of `partition`, primary first.
    fn replicas(&self, partition: PartitionId) -> Vec<NodeInfo>;

    /// Peers a write of `key` should be sent to, excluding this node. With
    /// `asynchronous` set only replicas outside this node's zone are listed.
    fn replication_targets(&self, key: &str, asynchronous: bool) -> Vec<NodeInfo>;

    fn role(&self, key: &str) -> Role;

    fn is_timestamper(&self, key: &str) -> bool {
        self.role(key) == Role::Timestamper
    }

    /// The node best placed to confirm dependencies on `key`: a replica in
    /// this node's zone when there is one.
    fn dependency_resolver(&self, key: &str) -> Option<NodeInfo> {
        let replicas = self.replicas(self.find_partition(key));
        replicas
            .iter()
            .find(|node| node.zone == self.zone_id())
            .or_else(|| replicas.first())
            .cloned()
    }

    /// A peer reported that our routing view is stale.
    fn request_metadata_refresh(&self, reported_by: NodeId);
}

pub struct StaticMembership {
    local: NodeInfo,
    nodes: HashMap<NodeId, NodeInfo>,
    partitions: Vec<PartitionConfig>,
    hash_seed: u64,
    timestamper: TimestamperPolicy,
    refresh_requests: AtomicU64,
}

impl StaticMembership {
    pub fn new(
        cluster: &ClusterConfig,
        local_id: NodeId,
        timestamper: TimestamperPolicy,
    ) -> Result<Self> {
        cluster.validate()?;
        let nodes: HashMap<NodeId, NodeInfo> = cluster
            .nodes
            .iter()
            .map(|node| (node.id, node.clone()))
            .collect();
        let local = nodes
            .get(&local_id)
            .cloned()
            .ok_or_else(|| anyhow!("local node id {local_id} missing from cluster"))?;
        Ok(Self {
            local,
            nodes,
            partitions: cluster.partitions.clone(),
            hash_seed: cluster.hash_seed,
            timestamper,
            refresh_requests: AtomicU64::new(0),
        })
    }

    pub fn refresh_requests(&self) -> u64 {
        self.refresh_requests.load(Ordering::Relaxed)
    }

    fn partition(&self, id: PartitionId) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|partition| partition.id == id)
    }

    fn hash_key(&self, key: &str) -> u64 {
        let mut hasher = XxHash64::with_seed(self.hash_seed);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl GroupMembership for StaticMembership {
    fn node_id(&self) -> NodeId {
        self.local.id
    }

    fn zone_id(&self) -> ZoneId {
        self.local.zone
    }

    fn partition_id(&self) -> PartitionId {
        self.partitions
            .iter()
            .find(|partition| partition.replicas.contains(&self.local.id))
            .map(|partition| partition.id)
            .unwrap_or_default()
    }

    fn find_partition(&self, key: &str) -> PartitionId {
        let index = (self.hash_key(key) % self.partitions.len() as u64) as usize;
        self.partitions[index].id
    }

    fn hosts(&self, partition: PartitionId) -> bool {
        self.partition(partition)
            .is_some_and(|partition| partition.replicas.contains(&self.local.id))
    }

    fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&id).cloned()
    }

    fn replicas(&self, partition: PartitionId) -> Vec<NodeInfo> {
        self.partition(partition)
            .map(|partition| {
                partition
                    .replicas
                    .iter()
                    .filter_map(|id| self.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn replication_targets(&self, key: &str, asynchronous: bool) -> Vec<NodeInfo> {
        let mut targets: Vec<NodeInfo> = self
            .replicas(self.find_partition(key))
            .into_iter()
            .filter(|node| node.id != self.local.id)
            .filter(|node| !asynchronous || node.zone != self.local.zone)
            .collect();
        // Same-zone replicas first; they answer fastest.
        targets.sort_by_key(|node| node.zone != self.local.zone);
        targets
    }

    fn role(&self, key: &str) -> Role {
        let Some(partition) = self.partition(self.find_partition(key)) else {
            return Role::Foreign;
        };
        if !partition.replicas.contains(&self.local.id) {
            return Role::Foreign;
        }
        match self.timestamper {
            TimestamperPolicy::AnyReplica => Role::Timestamper,
            TimestamperPolicy::PrimaryReplica if partition.replicas[0] == self.local.id => {
                Role::Timestamper
            }
            TimestamperPolicy::PrimaryReplica => Role::Replica,
        }
    }

    fn request_metadata_refresh(&self, reported_by: NodeId) {
        self.refresh_requests.fetch_add(1, Ordering::Relaxed);
        warn!(
            node = self.local.id,
            reported_by, "routing metadata reported stale; static membership cannot refresh"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, zone: ZoneId) -> NodeInfo {
        NodeInfo {
            id,
            zone,
            address: format!("127.0.0.1:{}", 7200 + id),
        }
    }

    fn two_partitions() -> ClusterConfig {
        ClusterConfig {
            nodes: vec![node(0, 0), node(1, 0), node(2, 1), node(3, 1)],
            partitions: vec![
                PartitionConfig {
                    id: 10,
                    replicas: vec![0, 2],
                },
                PartitionConfig {
                    id: 20,
                    replicas: vec![1, 3],
                },
            ],
            hash_seed: 7,
        }
    }

    #[test]
    fn routing_is_deterministic_across_nodes() -> Result<()> {
        let cluster = two_partitions();
        let a = StaticMembership::new(&cluster, 0, TimestamperPolicy::AnyReplica)?;
        let b = StaticMembership::new(&cluster, 3, TimestamperPolicy::AnyReplica)?;
        for i in 0..64 {
            let key = format!("key-{i}");
            assert_eq!(a.find_partition(&key), b.find_partition(&key));
        }
        Ok(())
    }

    #[test]
    fn targets_exclude_self_and_prefer_local_zone() -> Result<()> {
        let cluster = ClusterConfig::single_partition(vec![node(0, 1), node(1, 0), node(2, 1)]);
        let membership = StaticMembership::new(&cluster, 0, TimestamperPolicy::AnyReplica)?;

        let targets: Vec<NodeId> = membership
            .replication_targets("k", false)
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(targets, vec![2, 1]);

        let remote: Vec<NodeId> = membership
            .replication_targets("k", true)
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(remote, vec![1]);
        Ok(())
    }

    #[test]
    fn primary_policy_restricts_timestamping() -> Result<()> {
        let cluster = ClusterConfig::single_partition(vec![node(0, 0), node(1, 0)]);
        let primary = StaticMembership::new(&cluster, 0, TimestamperPolicy::PrimaryReplica)?;
        let secondary = StaticMembership::new(&cluster, 1, TimestamperPolicy::PrimaryReplica)?;
        assert!(primary.is_timestamper("k"));
        assert_eq!(secondary.role("k"), Role::Replica);
        assert!(!secondary.is_timestamper("k"));
        Ok(())
    }

    #[test]
    fn foreign_keys_are_not_hosted() -> Result<()> {
        let cluster = two_partitions();
        let membership = StaticMembership::new(&cluster, 0, TimestamperPolicy::AnyReplica)?;
        let foreign = (0..256)
            .map(|i| format!("key-{i}"))
            .find(|key| membership.find_partition(key) == 20)
            .expect("some key routes to partition 20");
        assert_eq!(membership.role(&foreign), Role::Foreign);
        assert!(!membership.hosts(20));
        assert_eq!(
            membership.dependency_resolver(&foreign).map(|n| n.id),
            Some(1)
        );
        Ok(())
    }

    #[test]
    fn missing_local_node_is_an_error() {
        let cluster = ClusterConfig::single_partition(vec![node(0, 0)]);
        assert!(StaticMembership::new(&cluster, 5, TimestamperPolicy::AnyReplica).is_err());
    }
}
