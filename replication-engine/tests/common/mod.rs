//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use replication_engine::communication::InternalCommunication;
use replication_engine::config::{ClusterConfig, EngineConfig, PartitionConfig};
use replication_engine::framework::Framework;
use replication_engine::membership::{GroupMembership, NodeInfo, PartitionId, StaticMembership};
use replication_engine::message::{Reply, Request, ZoneId};
use replication_engine::network::InProcessNetwork;
use replication_engine::storage::MemoryStorage;
use replication_engine::version::{NodeId, Versioned};

/// Nodes wired together through an [`InProcessNetwork`].
pub struct TestCluster {
    pub network: InProcessNetwork,
    nodes: Vec<Arc<Framework>>,
    storages: Vec<Arc<MemoryStorage>>,
    memberships: Vec<Arc<StaticMembership>>,
}

impl TestCluster {
    /// One partition replicated on every node. `zones[i]` is node i's zone.
    pub fn single_partition(zones: &[ZoneId], config: EngineConfig) -> Result<Self> {
        let cluster = ClusterConfig::single_partition(nodes(zones));
        Self::start(cluster, config)
    }

    /// Node i alone hosts partition i.
    pub fn partition_per_node(count: usize, config: EngineConfig) -> Result<Self> {
        let zones = vec![0; count];
        let cluster = ClusterConfig {
            nodes: nodes(&zones),
            partitions: (0..count)
                .map(|i| PartitionConfig {
                    id: i as PartitionId,
                    replicas: vec![i as NodeId],
                })
                .collect(),
            hash_seed: 0,
        };
        Self::start(cluster, config)
    }

    pub fn start(cluster: ClusterConfig, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let network = InProcessNetwork::new();
        let mut nodes = Vec::new();
        let mut storages = Vec::new();
        let mut memberships = Vec::new();

        for node in &cluster.nodes {
            let membership = Arc::new(StaticMembership::new(&cluster, node.id, config.timestamper)?);
            let storage = Arc::new(MemoryStorage::new(node.id));
            let framework = Arc::new(Framework::from_config(
                config.clone(),
                membership.clone(),
                storage.clone(),
                Arc::new(network.clone()),
            ));
            network.register(&framework);
            nodes.push(framework);
            storages.push(storage);
            memberships.push(membership);
        }

        Ok(Self {
            network,
            nodes,
            storages,
            memberships,
        })
    }

    pub fn node(&self, id: NodeId) -> &Arc<Framework> {
        &self.nodes[id as usize]
    }

    pub fn storage(&self, id: NodeId) -> &MemoryStorage {
        &self.storages[id as usize]
    }

    pub fn membership(&self, id: NodeId) -> &StaticMembership {
        &self.memberships[id as usize]
    }

    pub fn put(&self, id: NodeId, key: &str, value: &str) -> Reply {
        self.node(id).submit(Request::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            dependencies: Vec::new(),
        })
    }

    pub fn get(&self, id: NodeId, key: &str) -> Reply {
        self.node(id).submit(Request::Get {
            key: key.to_string(),
        })
    }

    pub fn stored(&self, id: NodeId, key: &str) -> Vec<Versioned> {
        self.storage(id).get(key).unwrap_or_default()
    }

    /// Values currently stored at `id`, tombstones skipped.
    pub fn values(&self, id: NodeId, key: &str) -> Vec<String> {
        self.stored(id, key)
            .into_iter()
            .filter_map(|versioned| versioned.value)
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .collect()
    }

    /// A key that routes to `partition`.
    pub fn key_in(&self, partition: PartitionId, prefix: &str) -> Result<String> {
        let membership = &self.memberships[0];
        (0..4096)
            .map(|i| format!("{prefix}-{i}"))
            .find(|key| membership.find_partition(key) == partition)
            .ok_or_else(|| anyhow!("no key routes to partition {partition}"))
    }

    pub fn wait_until<F>(&self, timeout: Duration, what: &str, condition: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        let start = Instant::now();
        loop {
            if condition() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timed out waiting for {what}");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Waits for every node's background replication to finish.
    pub fn settle(&self, timeout: Duration) -> Result<()> {
        self.wait_until(timeout, "background replication", || {
            self.nodes
                .iter()
                .all(|node| node.stats().replications_in_flight == 0)
        })
    }
}

fn nodes(zones: &[ZoneId]) -> Vec<NodeInfo> {
    zones
        .iter()
        .enumerate()
        .map(|(i, zone)| NodeInfo {
            id: i as NodeId,
            zone: *zone,
            address: format!("in-process-{i}"),
        })
        .collect()
}
