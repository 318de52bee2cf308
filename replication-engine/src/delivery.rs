//! Admission of writes into visible storage.
//!
//! [`CausalDelivery`] is the causal-consistency gate. A replicated write is
//! made visible only once every key it depends on has reached the required
//! version. Writes that must wait are parked in an arena of pending writes and
//! indexed by the keys they wait on; when one of those keys advances, the
//! waiters are re-checked and released, transitively.
//!
//! # Locking
//!
//! All dependency state lives in one [`DependencyTables`] behind one mutex.
//! Every check-then-mutate sequence (check a dependency, maybe register a
//! wait, maybe apply) runs with that mutex held, so a concurrent release scan
//! and a concurrent registration can never interleave. Storage is called with
//! the mutex held; the network never is. Outbound dependency traffic is
//! collected while locked and sent after the guard is dropped.
//!
//! [`ImmediateDelivery`] is the quorum variant's gate: every write is applied
//! on arrival and dependencies are not tracked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::communication::{ExternalCommunication, InternalCommunication};
use crate::error::{EngineError, EngineResult, ReplicaError};
use crate::membership::{GroupMembership, NodeInfo};
use crate::message::{Dependency, DependencyRequest, Key, Message, MessageKind, Request, Value};
use crate::order::Order;
use crate::version::{Version, VersionOrder, Versioned, compare_optional};

/// What happened to a message handed to [`DeliveryCondition::try_to_apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The write is now durable and visible.
    Visible,
    /// Storage already held this version or a newer one; nothing changed.
    Duplicate,
    /// The write waits on unresolved dependencies.
    Pending,
    /// A dependency confirmation released this many parked writes.
    Released(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub pending: usize,
    pub local_waiters: usize,
    pub remote_waiters: usize,
}

pub trait DeliveryCondition: Send + Sync {
    /// Applies a local write, a replicated write, or a dependency
    /// confirmation, depending on `message.kind`.
    fn try_to_apply(&self, message: &mut Message) -> EngineResult<Applied>;

    /// Registers a peer waiting for `request.key` to reach `request.version`.
    /// Returns the durable version instead, without registering, when it
    /// already satisfies the request.
    fn register_remote_waiter(&self, request: DependencyRequest) -> EngineResult<Option<Version>>;

    /// Drops parked writes older than the retention bound. Returns how many.
    fn evict_expired(&self, now: Instant) -> usize;

    fn stats(&self) -> DeliveryStats;
}

type PendingId = u64;

/// A replicated write that cannot be made visible yet.
#[derive(Debug)]
struct PendingWrite {
    key: Key,
    value: Option<Value>,
    version: Version,
    remaining: Vec<Dependency>,
    parked_at: Instant,
}

#[derive(Debug, Default)]
struct DependencyTables {
    next_id: PendingId,
    pending: HashMap<PendingId, PendingWrite>,
    /// Wanted key -> parked writes waiting on it.
    local_waiters: HashMap<Key, Vec<PendingId>>,
    /// Wanted key -> peers waiting for it to advance.
    remote_waiters: HashMap<Key, Vec<DependencyRequest>>,
}

impl DependencyTables {
    fn park(&mut self, write: PendingWrite) -> PendingId {
        let id = self.next_id;
        self.next_id += 1;
        for dep in &write.remaining {
            let waiters = self.local_waiters.entry(dep.key.clone()).or_default();
            if !waiters.contains(&id) {
                waiters.push(id);
            }
        }
        self.pending.insert(id, write);
        id
    }

    /// Re-checks every write waiting on `key` against `reached`. Writes with
    /// nothing left to wait for are removed and returned.
    fn release(&mut self, key: &str, reached: &Version) -> Vec<PendingWrite> {
        let Some(ids) = self.local_waiters.remove(key) else {
            return Vec::new();
        };

        let mut still_waiting = Vec::new();
        let mut released = Vec::new();
        for id in ids {
            let Some(write) = self.pending.get_mut(&id) else {
                continue;
            };
            write
                .remaining
                .retain(|dep| dep.key != key || !reached.satisfies(&dep.version));
            if write.remaining.is_empty() {
                if let Some(write) = self.pending.remove(&id) {
                    released.push(write);
                }
            } else if write.remaining.iter().any(|dep| dep.key == key) {
                still_waiting.push(id);
            }
        }

        if !still_waiting.is_empty() {
            self.local_waiters.insert(key.to_string(), still_waiting);
        }
        released
    }

    /// Removes and returns the peers whose requested version `durable`
    /// satisfies.
    fn take_satisfied_remote(&mut self, key: &str, durable: &Version) -> Vec<DependencyRequest> {
        let Some(waiters) = self.remote_waiters.remove(key) else {
            return Vec::new();
        };
        let (satisfied, waiting): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .partition(|request| durable.satisfies(&request.version));
        if !waiting.is_empty() {
            self.remote_waiters.insert(key.to_string(), waiting);
        }
        satisfied
    }

    fn evict(&mut self, id: PendingId) -> Option<PendingWrite> {
        let write = self.pending.remove(&id)?;
        for dep in &write.remaining {
            if let Some(waiters) = self.local_waiters.get_mut(&dep.key) {
                waiters.retain(|waiting| *waiting != id);
                if waiters.is_empty() {
                    self.local_waiters.remove(&dep.key);
                }
            }
        }
        Some(write)
    }
}

/// Dependency traffic gathered under the lock and sent after it is released.
type Outbox = Vec<(NodeInfo, Request)>;

pub struct CausalDelivery {
    storage: Arc<dyn InternalCommunication>,
    membership: Arc<dyn GroupMembership>,
    order: Arc<dyn Order>,
    network: Arc<dyn ExternalCommunication>,
    dependency_timeout: Duration,
    retention: Option<Duration>,
    tables: Mutex<DependencyTables>,
}

impl CausalDelivery {
    pub fn new(
        storage: Arc<dyn InternalCommunication>,
        membership: Arc<dyn GroupMembership>,
        order: Arc<dyn Order>,
        network: Arc<dyn ExternalCommunication>,
        dependency_timeout: Duration,
        retention: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            membership,
            order,
            network,
            dependency_timeout,
            retention,
            tables: Mutex::new(DependencyTables::default()),
        }
    }

    fn flush(&self, outbox: Outbox) {
        for (node, request) in outbox {
            self.network.notify(&node, request, self.dependency_timeout);
        }
    }

    /// Splits `dependencies` into the ones already met and the ones still
    /// outstanding. Keys hosted elsewhere are always outstanding.
    fn check_dependencies(&self, dependencies: &[Dependency]) -> EngineResult<Vec<Dependency>> {
        let mut remaining = Vec::new();
        for dep in dependencies {
            if !self.hosted_locally(&dep.key) {
                remaining.push(dep.clone());
                continue;
            }
            let durable = self.storage.durable_version(&dep.key).map_err(storage_error)?;
            let met = matches!(
                compare_optional(Some(&dep.version), durable.as_ref()),
                VersionOrder::Before | VersionOrder::Tie
            );
            if !met {
                remaining.push(dep.clone());
            }
        }
        Ok(remaining)
    }

    fn hosted_locally(&self, key: &str) -> bool {
        self.membership.hosts(self.membership.find_partition(key))
    }

    /// Writes `first` and, transitively, every parked write its visibility
    /// releases. The result describes `first` only.
    fn make_visible(
        &self,
        tables: &mut DependencyTables,
        first: (Key, Option<Value>, Version),
        outbox: &mut Outbox,
    ) -> EngineResult<Applied> {
        let mut queue = VecDeque::from([first]);
        let mut outcome = None;

        while let Some((key, value, version)) = queue.pop_front() {
            let result = self.apply_one(tables, &key, value, version, outbox, &mut queue);
            match (outcome.is_none(), result) {
                (true, result) => outcome = Some(result?),
                (false, Ok(_)) => {}
                (false, Err(error)) => {
                    warn!(key = %key, %error, "released write could not be applied; dropping it");
                }
            }
        }

        Ok(outcome.unwrap_or(Applied::Duplicate))
    }

    fn apply_one(
        &self,
        tables: &mut DependencyTables,
        key: &str,
        value: Option<Value>,
        version: Version,
        outbox: &mut Outbox,
        queue: &mut VecDeque<(Key, Option<Value>, Version)>,
    ) -> EngineResult<Applied> {
        let stored = self.storage.get(key).map_err(storage_error)?;
        let already_applied = stored.iter().any(|existing| {
            matches!(
                self.order.compare_messages(&version, &existing.version),
                VersionOrder::Before | VersionOrder::Tie
            )
        });
        if already_applied {
            debug!(key = %key, %version, "write already reflected in storage");
            return Ok(Applied::Duplicate);
        }

        match self.storage.put(key, Versioned::new(value, version.clone())) {
            Ok(()) => {}
            Err(ReplicaError::ObsoleteVersion { .. }) => return Ok(Applied::Duplicate),
            Err(error) => return Err(storage_error(error)),
        }
        debug!(key = %key, %version, "write visible");

        self.post_visibility(tables, key, outbox, queue)?;
        Ok(Applied::Visible)
    }

    /// Releases local waiters on `key` and answers remote ones that are now
    /// satisfied. Each remote waiter is answered once and forgotten.
    fn post_visibility(
        &self,
        tables: &mut DependencyTables,
        key: &str,
        outbox: &mut Outbox,
        queue: &mut VecDeque<(Key, Option<Value>, Version)>,
    ) -> EngineResult<()> {
        let Some(durable) = self.storage.durable_version(key).map_err(storage_error)? else {
            return Ok(());
        };

        for write in tables.release(key, &durable) {
            debug!(key = %write.key, unblocked_by = %key, "pending write released");
            queue.push_back((write.key, write.value, write.version));
        }

        for request in tables.take_satisfied_remote(key, &durable) {
            match self.membership.node(request.requester) {
                Some(node) => outbox.push((
                    node,
                    Request::DependencyResponse {
                        key: key.to_string(),
                        version: durable.clone(),
                    },
                )),
                None => warn!(requester = request.requester, "dependency waiter is not a known node"),
            }
        }
        Ok(())
    }

    fn apply_replicated(&self, message: &mut Message) -> EngineResult<Applied> {
        let version = message.meta.version.clone().unwrap_or_default();
        self.order.update_clock(&version);

        let mut outbox = Outbox::new();
        let outcome = {
            let mut tables = self.tables.lock();
            let remaining = self.check_dependencies(&message.meta.dependencies)?;
            message.meta.remaining_dependencies = remaining.clone();

            if remaining.is_empty() {
                self.make_visible(
                    &mut tables,
                    (
                        message.content.key.clone(),
                        message.content.value.clone(),
                        version,
                    ),
                    &mut outbox,
                )?
            } else {
                for dep in remaining.iter().filter(|dep| !self.hosted_locally(&dep.key)) {
                    match self.membership.dependency_resolver(&dep.key) {
                        Some(node) => outbox.push((
                            node,
                            Request::DependencyRequest {
                                key: dep.key.clone(),
                                version: dep.version.clone(),
                                requester: self.membership.node_id(),
                            },
                        )),
                        None => warn!(key = %dep.key, "no node can resolve dependency"),
                    }
                }
                debug!(
                    key = %message.content.key,
                    waiting_on = remaining.len(),
                    "replicated write parked"
                );
                tables.park(PendingWrite {
                    key: message.content.key.clone(),
                    value: message.content.value.clone(),
                    version,
                    remaining,
                    parked_at: Instant::now(),
                });
                Applied::Pending
            }
        };
        self.flush(outbox);
        Ok(outcome)
    }

    fn apply_local(&self, message: &Message) -> EngineResult<Applied> {
        let version = message.meta.version.clone().unwrap_or_default();
        let mut outbox = Outbox::new();
        let outcome = {
            let mut tables = self.tables.lock();
            self.make_visible(
                &mut tables,
                (
                    message.content.key.clone(),
                    message.content.value.clone(),
                    version,
                ),
                &mut outbox,
            )?
        };
        self.flush(outbox);
        Ok(outcome)
    }

    fn apply_confirmation(&self, message: &Message) -> EngineResult<Applied> {
        let confirmed = message.meta.version.clone().unwrap_or_default();
        let key = &message.content.key;
        let mut outbox = Outbox::new();
        let released = {
            let mut tables = self.tables.lock();
            let writes = tables.release(key, &confirmed);
            let released = writes.len();
            for write in writes {
                self.make_visible(&mut tables, (write.key, write.value, write.version), &mut outbox)?;
            }
            released
        };
        self.flush(outbox);
        Ok(Applied::Released(released))
    }
}

impl DeliveryCondition for CausalDelivery {
    fn try_to_apply(&self, message: &mut Message) -> EngineResult<Applied> {
        match message.kind {
            MessageKind::Put | MessageKind::Delete => self.apply_local(message),
            MessageKind::Replicate => self.apply_replicated(message),
            MessageKind::DependencyResponse => self.apply_confirmation(message),
            MessageKind::Get | MessageKind::Fetch | MessageKind::DependencyRequest => {
                Ok(Applied::Duplicate)
            }
        }
    }

    fn register_remote_waiter(&self, request: DependencyRequest) -> EngineResult<Option<Version>> {
        let mut tables = self.tables.lock();
        let durable = self
            .storage
            .durable_version(&request.key)
            .map_err(storage_error)?;
        if let Some(durable) = durable {
            // Already met: the caller answers now, so no waiter is kept to answer again.
            if durable.satisfies(&request.version) {
                return Ok(Some(durable));
            }
        }
        let waiters = tables.remote_waiters.entry(request.key.clone()).or_default();
        if !waiters.contains(&request) {
            waiters.push(request);
        }
        Ok(None)
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let mut tables = self.tables.lock();
        let expired: Vec<PendingId> = tables
            .pending
            .iter()
            .filter(|(_, write)| now.saturating_duration_since(write.parked_at) >= retention)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(write) = tables.evict(*id) {
                warn!(
                    key = %write.key,
                    version = %write.version,
                    unresolved = write.remaining.len(),
                    "evicting write whose dependencies never resolved"
                );
            }
        }
        expired.len()
    }

    fn stats(&self) -> DeliveryStats {
        let tables = self.tables.lock();
        DeliveryStats {
            pending: tables.pending.len(),
            local_waiters: tables.local_waiters.values().map(Vec::len).sum(),
            remote_waiters: tables.remote_waiters.values().map(Vec::len).sum(),
        }
    }
}

/// Applies every write as it arrives. Used when versions are reconciled by
/// quorum rather than gated on dependencies.
pub struct ImmediateDelivery {
    storage: Arc<dyn InternalCommunication>,
    order: Arc<dyn Order>,
}

impl ImmediateDelivery {
    pub fn new(storage: Arc<dyn InternalCommunication>, order: Arc<dyn Order>) -> Self {
        Self { storage, order }
    }
}

impl DeliveryCondition for ImmediateDelivery {
    fn try_to_apply(&self, message: &mut Message) -> EngineResult<Applied> {
        match message.kind {
            MessageKind::Put | MessageKind::Delete | MessageKind::Replicate => {
                let version = message.meta.version.clone().unwrap_or_default();
                if message.kind == MessageKind::Replicate {
                    self.order.update_clock(&version);
                }
                let versioned = Versioned::new(message.content.value.clone(), version);
                match self.storage.put(&message.content.key, versioned) {
                    Ok(()) => Ok(Applied::Visible),
                    Err(ReplicaError::ObsoleteVersion { .. }) => Ok(Applied::Duplicate),
                    Err(error) => Err(storage_error(error)),
                }
            }
            MessageKind::DependencyResponse => Ok(Applied::Released(0)),
            MessageKind::Get | MessageKind::Fetch | MessageKind::DependencyRequest => {
                Ok(Applied::Duplicate)
            }
        }
    }

    fn register_remote_waiter(&self, request: DependencyRequest) -> EngineResult<Option<Version>> {
        let durable = self
            .storage
            .durable_version(&request.key)
            .map_err(storage_error)?;
        Ok(durable.filter(|durable| durable.satisfies(&request.version)))
    }

    fn evict_expired(&self, _now: Instant) -> usize {
        0
    }

    fn stats(&self) -> DeliveryStats {
        DeliveryStats::default()
    }
}

fn storage_error(error: ReplicaError) -> EngineError {
    match error {
        ReplicaError::QuotaExceeded { node } => EngineError::Storage {
            reason: format!("quota exceeded at node {node}"),
        },
        other => other.into(),
    }
}
