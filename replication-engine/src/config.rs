//! Engine and cluster configuration.
//!
//! A node reads one JSON file holding an [`EngineConfig`] and a
//! [`ClusterConfig`]. Every engine option has a default, so a file only needs
//! to spell out the cluster layout. The concrete strategy implementations are
//! chosen from [`ConsistencyMode`] when the framework is built.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::membership::{NodeInfo, PartitionId};
use crate::version::NodeId;

/// Which family of strategies the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Lamport clock, causal admission gate, replies before replicating.
    #[default]
    Causal,
    /// Vector clock, immediate admission, replies after a quorum of acks.
    Quorum,
}

/// Which replicas may assign the initial version of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestamperPolicy {
    /// Every replica of the key's partition.
    #[default]
    AnyReplica,
    /// Only the first replica listed for the partition.
    PrimaryReplica,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: ConsistencyMode,
    pub required_writes: usize,
    pub preferred_writes: usize,
    pub required_reads: usize,
    pub preferred_reads: usize,
    /// Distinct zones, beyond the local one, that must acknowledge. 0 disables.
    pub required_zones: usize,
    pub put_timeout_ms: u64,
    pub get_timeout_ms: u64,
    pub delete_timeout_ms: u64,
    pub dependency_timeout_ms: u64,
    pub repair_reads: bool,
    /// How long a write may wait on unresolved dependencies. 0 keeps it forever.
    pub pending_retention_ms: u64,
    pub timestamper: TimestamperPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ConsistencyMode::Causal,
            required_writes: 2,
            preferred_writes: 3,
            required_reads: 1,
            preferred_reads: 1,
            required_zones: 0,
            put_timeout_ms: 5_000,
            get_timeout_ms: 5_000,
            delete_timeout_ms: 5_000,
            dependency_timeout_ms: 5_000,
            repair_reads: true,
            pending_retention_ms: 60_000,
            timestamper: TimestamperPolicy::AnyReplica,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.required_writes >= 1, "required_writes must be at least 1");
        ensure!(
            self.preferred_writes >= self.required_writes,
            "preferred_writes ({}) must be >= required_writes ({})",
            self.preferred_writes,
            self.required_writes
        );
        ensure!(self.required_reads >= 1, "required_reads must be at least 1");
        ensure!(
            self.preferred_reads >= self.required_reads,
            "preferred_reads ({}) must be >= required_reads ({})",
            self.preferred_reads,
            self.required_reads
        );
        ensure!(
            self.put_timeout_ms > 0
                && self.get_timeout_ms > 0
                && self.delete_timeout_ms > 0
                && self.dependency_timeout_ms > 0,
            "timeouts must be non-zero"
        );
        Ok(())
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_timeout_ms)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn pending_retention(&self) -> Option<Duration> {
        (self.pending_retention_ms > 0).then(|| Duration::from_millis(self.pending_retention_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub id: PartitionId,
    /// Replica node ids, primary first.
    pub replicas: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeInfo>,
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub hash_seed: u64,
}

impl ClusterConfig {
    /// One partition replicated on every listed node.
    pub fn single_partition(nodes: Vec<NodeInfo>) -> Self {
        let replicas = nodes.iter().map(|node| node.id).collect();
        Self {
            nodes,
            partitions: vec![PartitionConfig { id: 0, replicas }],
            hash_seed: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.nodes.is_empty(), "cluster requires at least one node");
        ensure!(
            !self.partitions.is_empty(),
            "cluster requires at least one partition"
        );

        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            ensure!(ids.insert(node.id), "duplicate node id {}", node.id);
        }

        let mut partition_ids = BTreeSet::new();
        for partition in &self.partitions {
            ensure!(
                partition_ids.insert(partition.id),
                "duplicate partition id {}",
                partition.id
            );
            ensure!(
                !partition.replicas.is_empty(),
                "partition {} has no replicas",
                partition.id
            );
            for replica in &partition.replicas {
                ensure!(
                    ids.contains(replica),
                    "partition {} references unknown node {}",
                    partition.id,
                    replica
                );
            }
        }
        Ok(())
    }
}

/// Contents of a node's configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFile {
    #[serde(default)]
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
}

impl NodeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let file: NodeFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        file.engine.validate()?;
        file.cluster.validate()?;
        Ok(file)
    }
}
