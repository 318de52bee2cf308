//! Per-message state machine of a replica.
//!
//! A [`Framework`] is built from one fixed set of strategy objects
//! ([`Components`]) and routes every inbound [`Message`] through them:
//!
//! - **PUT / DELETE**: refuse unless this node may timestamp the key, stamp
//!   with [`Order`], apply through [`DeliveryCondition`], then replicate. In
//!   causal mode the client is answered first and replication runs in the
//!   background; in quorum mode the answer carries the quorum outcome.
//! - **GET**: read locally; in quorum mode with more than one required read,
//!   gather a read quorum and repair stale replicas.
//! - **REPLICATE**: hand to the delivery gate; answer `Ack`, or
//!   `ObsoleteVersion` when the replica already had the write.
//! - **DEPENDENCY_REQUEST / DEPENDENCY_RESPONSE**: register or resolve
//!   cross-node dependency waits.
//!
//! `handle` blocks for as long as the operation needs (a quorum write waits
//! for acknowledgements). Callers run it on a thread that may block.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn};

use crate::communication::{ExternalCommunication, InternalCommunication};
use crate::config::{ConsistencyMode, EngineConfig};
use crate::delivery::{Applied, CausalDelivery, DeliveryCondition, DeliveryStats, ImmediateDelivery};
use crate::error::{EngineError, ReplicaError};
use crate::membership::{GroupMembership, NodeInfo};
use crate::message::{DependencyRequest, Message, MessageKind, MetaData, Reply, Request, Responder};
use crate::order::{LamportOrder, Order, VectorOrder};
use crate::quorum::QuorumPolicy;
use crate::replicate::{QuorumReplicate, Replicate};
use crate::version::{NodeId, Version, Versioned, now_ms};

/// The strategy objects a [`Framework`] runs with.
pub struct Components {
    pub config: EngineConfig,
    pub membership: Arc<dyn GroupMembership>,
    pub storage: Arc<dyn InternalCommunication>,
    pub network: Arc<dyn ExternalCommunication>,
    pub order: Arc<dyn Order>,
    pub delivery: Arc<dyn DeliveryCondition>,
    pub replicate: Arc<dyn Replicate>,
}

impl Components {
    /// The standard wiring for `config.mode`.
    pub fn for_mode(
        config: EngineConfig,
        membership: Arc<dyn GroupMembership>,
        storage: Arc<dyn InternalCommunication>,
        network: Arc<dyn ExternalCommunication>,
    ) -> Self {
        let node_id = membership.node_id();
        let replicate: Arc<dyn Replicate> = Arc::new(QuorumReplicate::new(
            Arc::clone(&network),
            Arc::clone(&membership),
            QuorumPolicy::writes(&config),
            QuorumPolicy::reads(&config),
            config.repair_reads,
        ));

        let (order, delivery) = match config.mode {
            ConsistencyMode::Causal => {
                let order: Arc<dyn Order> = Arc::new(LamportOrder::new(node_id));
                let delivery: Arc<dyn DeliveryCondition> = Arc::new(CausalDelivery::new(
                    Arc::clone(&storage),
                    Arc::clone(&membership),
                    Arc::clone(&order),
                    Arc::clone(&network),
                    config.dependency_timeout(),
                    config.pending_retention(),
                ));
                (order, delivery)
            }
            ConsistencyMode::Quorum => {
                let order: Arc<dyn Order> = Arc::new(VectorOrder::new(node_id));
                let delivery: Arc<dyn DeliveryCondition> = Arc::new(ImmediateDelivery::new(
                    Arc::clone(&storage),
                    Arc::clone(&order),
                ));
                (order, delivery)
            }
        };

        Self {
            config,
            membership,
            storage,
            network,
            order,
            delivery,
            replicate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkStats {
    pub delivery: DeliveryStats,
    /// Background replications not yet finished.
    pub replications_in_flight: usize,
    pub clock: Version,
}

pub struct Framework {
    config: EngineConfig,
    membership: Arc<dyn GroupMembership>,
    storage: Arc<dyn InternalCommunication>,
    network: Arc<dyn ExternalCommunication>,
    order: Arc<dyn Order>,
    delivery: Arc<dyn DeliveryCondition>,
    replicate: Arc<dyn Replicate>,
    in_flight: Arc<AtomicUsize>,
}

impl Framework {
    pub fn new(components: Components) -> Self {
        let Components {
            config,
            membership,
            storage,
            network,
            order,
            delivery,
            replicate,
        } = components;
        info!(
            node = membership.node_id(),
            zone = membership.zone_id(),
            mode = ?config.mode,
            "replication engine ready"
        );
        Self {
            config,
            membership,
            storage,
            network,
            order,
            delivery,
            replicate,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(
        config: EngineConfig,
        membership: Arc<dyn GroupMembership>,
        storage: Arc<dyn InternalCommunication>,
        network: Arc<dyn ExternalCommunication>,
    ) -> Self {
        Self::new(Components::for_mode(config, membership, storage, network))
    }

    pub fn node_id(&self) -> NodeId {
        self.membership.node_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processes `message` and answers through its responder, if it has one.
    pub fn handle(&self, mut message: Message) {
        let span = info_span!(
            "request",
            id = %message.meta.request_id,
            kind = ?message.kind,
            key = %message.content.key,
        );
        let _entered = span.enter();

        match message.kind {
            MessageKind::Put | MessageKind::Delete => self.handle_write(message),
            MessageKind::Get => self.handle_get(&mut message),
            MessageKind::Fetch => self.handle_fetch(&mut message),
            MessageKind::Replicate => self.handle_replicate(&mut message),
            MessageKind::DependencyRequest => self.handle_dependency_request(&mut message),
            MessageKind::DependencyResponse => self.handle_dependency_response(&mut message),
        }
    }

    /// Runs `request` to completion and returns its reply.
    pub fn submit(&self, request: Request) -> Reply {
        let (responder, rx) = Responder::channel();
        self.handle(Message::from_request(request, Some(responder)));
        rx.recv().unwrap_or(Reply::Failed {
            error: EngineError::Shutdown,
        })
    }

    /// Drops pending writes whose dependencies outlived the retention bound.
    pub fn evict_expired(&self) -> usize {
        self.delivery.evict_expired(Instant::now())
    }

    pub fn stats(&self) -> FrameworkStats {
        FrameworkStats {
            delivery: self.delivery.stats(),
            replications_in_flight: self.in_flight.load(Ordering::Acquire),
            clock: self.order.current(),
        }
    }

    fn handle_write(&self, mut message: Message) {
        let key = message.content.key.clone();
        if !self.membership.is_timestamper(&key) {
            warn!(node = self.node_id(), "refusing write for key this node may not timestamp");
            self.respond(&mut message.meta, Reply::Failed {
                error: EngineError::NotAuthorized {
                    key,
                    node: self.node_id(),
                },
            });
            return;
        }

        let durable = match self.storage.durable_version(&key) {
            Ok(durable) => durable,
            Err(error) => {
                self.respond(&mut message.meta, Reply::Failed { error: error.into() });
                return;
            }
        };
        let version = self
            .order
            .time_stamping(&message.content, durable.as_ref(), now_ms());
        message.meta.version = Some(version.clone());

        if let Err(error) = self.delivery.try_to_apply(&mut message) {
            warn!(%error, "local write failed");
            self.respond(&mut message.meta, Reply::Failed { error });
            return;
        }
        match message.kind {
            MessageKind::Delete => message.meta.delete_successes += 1,
            _ => message.meta.put_successes += 1,
        }
        message.meta.zones.insert(self.membership.zone_id());
        debug!(%version, "write committed locally");

        let request = Request::Replicate {
            key: key.clone(),
            value: message.content.value.clone(),
            version: version.clone(),
            dependencies: message.meta.dependencies.clone(),
            origin: self.node_id(),
        };
        let targets = self.membership.replication_targets(&key, false);
        let timeout = match message.kind {
            MessageKind::Delete => self.config.delete_timeout(),
            _ => self.config.put_timeout(),
        };

        match self.config.mode {
            ConsistencyMode::Causal => {
                self.respond(&mut message.meta, Reply::Stored { version });
                self.replicate_in_background(message, request, targets, timeout);
            }
            ConsistencyMode::Quorum => {
                let outcome = self
                    .replicate
                    .replicate(&mut message.meta, request, targets, timeout);
                match outcome {
                    Ok(report) => {
                        debug!(successes = report.successes, "write quorum reached");
                        self.respond(&mut message.meta, Reply::Stored { version });
                    }
                    Err(error) => {
                        warn!(%error, "write quorum not reached");
                        self.respond(&mut message.meta, Reply::Failed { error });
                    }
                }
            }
        }
    }

    fn replicate_in_background(
        &self,
        mut message: Message,
        request: Request,
        targets: Vec<NodeInfo>,
        timeout: Duration,
    ) {
        if targets.is_empty() {
            return;
        }
        let replicate = Arc::clone(&self.replicate);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        let span = tracing::Span::current();

        thread::spawn(move || {
            let _entered = span.enter();
            match replicate.replicate(&mut message.meta, request, targets, timeout) {
                Ok(report) => debug!(
                    successes = report.successes,
                    unanswered = report.unanswered,
                    "background replication finished"
                ),
                Err(error) => warn!(%error, "background replication fell short"),
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn handle_get(&self, message: &mut Message) {
        let key = message.content.key.clone();
        let local = match self.storage.get(&key) {
            Ok(local) => local,
            Err(error) => {
                self.respond(&mut message.meta, Reply::Failed { error: error.into() });
                return;
            }
        };
        message.meta.get_successes += 1;
        message.meta.zones.insert(self.membership.zone_id());

        let wants_quorum = self.config.mode == ConsistencyMode::Quorum
            && self.config.required_reads.max(self.config.preferred_reads) > 1;
        if !wants_quorum {
            self.respond(&mut message.meta, Reply::Values { versions: local });
            return;
        }

        let targets = self.membership.replication_targets(&key, false);
        let outcome = self.replicate.read(
            &mut message.meta,
            &key,
            local,
            targets,
            self.config.get_timeout(),
        );
        match outcome {
            Ok(outcome) => {
                if self.config.repair_reads {
                    self.repair_locally(&key, outcome.local_missing);
                }
                self.respond(&mut message.meta, Reply::Values {
                    versions: outcome.versions,
                });
            }
            Err(error) => {
                warn!(%error, "read quorum not reached");
                self.respond(&mut message.meta, Reply::Failed { error });
            }
        }
    }

    fn repair_locally(&self, key: &str, missing: Vec<Versioned>) {
        for versioned in missing {
            match self.storage.put(key, versioned) {
                Ok(()) | Err(ReplicaError::ObsoleteVersion { .. }) => {}
                Err(error) => warn!(%error, "local read repair failed"),
            }
        }
    }

    fn handle_fetch(&self, message: &mut Message) {
        let reply = match self.storage.get(&message.content.key) {
            Ok(versions) => Reply::Values { versions },
            Err(error) => Reply::Rejected { error },
        };
        self.respond(&mut message.meta, reply);
    }

    fn handle_replicate(&self, message: &mut Message) {
        if !self.hosts_key(&message.content.key) {
            self.respond(&mut message.meta, Reply::Rejected {
                error: ReplicaError::InvalidMetadata {
                    node: self.node_id(),
                    reason: format!("key {} is not hosted here", message.content.key),
                },
            });
            return;
        }

        let evicted = self.evict_expired();
        if evicted > 0 {
            debug!(evicted, "expired pending writes dropped");
        }

        let reply = match self.delivery.try_to_apply(message) {
            Ok(Applied::Duplicate) => Reply::Rejected {
                error: ReplicaError::ObsoleteVersion {
                    key: message.content.key.clone(),
                },
            },
            Ok(_) => Reply::Ack,
            Err(error) => Reply::Rejected {
                error: ReplicaError::Storage {
                    reason: error.to_string(),
                },
            },
        };
        self.respond(&mut message.meta, reply);
    }

    fn handle_dependency_request(&self, message: &mut Message) {
        let key = message.content.key.clone();
        let (Some(version), Some(requester)) = (message.meta.version.clone(), message.meta.origin)
        else {
            self.respond(&mut message.meta, Reply::Rejected {
                error: ReplicaError::InvalidMetadata {
                    node: self.node_id(),
                    reason: "dependency request without version or requester".to_string(),
                },
            });
            return;
        };
        if !self.hosts_key(&key) {
            self.respond(&mut message.meta, Reply::Rejected {
                error: ReplicaError::InvalidMetadata {
                    node: self.node_id(),
                    reason: format!("key {key} is not hosted here"),
                },
            });
            return;
        }

        let registered = self.delivery.register_remote_waiter(DependencyRequest {
            key: key.clone(),
            version,
            requester,
        });
        match registered {
            Ok(Some(durable)) => {
                self.respond(&mut message.meta, Reply::Ack);
                match self.membership.node(requester) {
                    Some(node) => self.network.notify(
                        &node,
                        Request::DependencyResponse { key, version: durable },
                        self.config.dependency_timeout(),
                    ),
                    None => warn!(requester, "dependency requester is not a known node"),
                }
            }
            Ok(None) => {
                debug!(requester, "dependency not met yet; waiter registered");
                self.respond(&mut message.meta, Reply::Ack);
            }
            Err(error) => self.respond(&mut message.meta, Reply::Rejected {
                error: ReplicaError::Storage {
                    reason: error.to_string(),
                },
            }),
        }
    }

    fn handle_dependency_response(&self, message: &mut Message) {
        let reply = match self.delivery.try_to_apply(message) {
            Ok(Applied::Released(released)) => {
                debug!(released, "dependency confirmed");
                Reply::Ack
            }
            Ok(_) => Reply::Ack,
            Err(error) => Reply::Rejected {
                error: ReplicaError::Storage {
                    reason: error.to_string(),
                },
            },
        };
        self.respond(&mut message.meta, reply);
    }

    /// Answers the originator through the network boundary, once.
    fn respond(&self, meta: &mut MetaData, reply: Reply) {
        if let Some(responder) = meta.reply_to.take() {
            self.network.reply_to_client(responder, reply);
        }
    }

    fn hosts_key(&self, key: &str) -> bool {
        self.membership.hosts(self.membership.find_partition(key))
    }
}
