//! Fan-out to replicas and the bounded wait for their answers.
//!
//! [`QuorumReplicate`] sends one request per target through
//! [`ExternalCommunication`]. Each completion callback pushes a
//! [`Response`] onto a channel; the calling thread blocks on that channel
//! until the policy is met, every target has answered, or the deadline
//! passes. It then raises a cutoff flag, after which callbacks drop their
//! results, and drains whatever was queued before the flag went up.
//!
//! Answers are classified as they are folded into [`MetaData`]:
//!
//! | Answer | Effect |
//! |---|---|
//! | ack / values | success, zone recorded |
//! | `ObsoleteVersion` | success: the replica is already as new |
//! | `InvalidMetadata` | failure, and a metadata refresh is requested |
//! | `QuotaExceeded` | neither; handed to [`HintedHandoff`] |
//! | anything else | failure |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::{debug, warn};

use crate::communication::ExternalCommunication;
use crate::error::{EngineError, EngineResult, ReplicaError};
use crate::membership::{GroupMembership, NodeInfo};
use crate::message::{MetaData, Reply, Request, ZoneId};
use crate::quorum::QuorumPolicy;
use crate::version::{NodeId, VersionOrder, Versioned};

/// One replica's answer, as queued by its completion callback.
#[derive(Debug)]
pub struct Response {
    pub node: NodeId,
    pub zone: ZoneId,
    pub result: Result<Reply, ReplicaError>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Acknowledgements, the local commit included.
    pub successes: usize,
    pub zones: usize,
    pub failures: Vec<(NodeId, ReplicaError)>,
    /// Replicas that refused for resource reasons.
    pub hinted: Vec<NodeId>,
    /// Targets that had not answered at cutoff.
    pub unanswered: usize,
    pub satisfied: bool,
}

/// Result of a quorum read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Versions not dominated by any other version seen.
    pub versions: Vec<Versioned>,
    /// Winning versions the local replica is missing.
    pub local_missing: Vec<Versioned>,
    /// Remote replicas that were sent a repair.
    pub repaired: Vec<NodeId>,
    pub report: ReplicationReport,
}

/// Deferred delivery for replicas that refused a write under pressure.
pub trait HintedHandoff: Send + Sync {
    fn hint(&self, node: &NodeInfo, request: &Request);
}

pub trait Replicate: Send + Sync {
    /// Sends `request` to `targets` and waits, at most until
    /// `meta.started_at + timeout`, for the write policy to be met. `meta`
    /// already counts the local commit.
    fn replicate(
        &self,
        meta: &mut MetaData,
        request: Request,
        targets: Vec<NodeInfo>,
        timeout: Duration,
    ) -> EngineResult<ReplicationReport>;

    /// Fetches `key` from `targets` until the read policy is met, then
    /// reconciles the answers with `local`.
    fn read(
        &self,
        meta: &mut MetaData,
        key: &str,
        local: Vec<Versioned>,
        targets: Vec<NodeInfo>,
        timeout: Duration,
    ) -> EngineResult<ReadOutcome>;
}

pub struct QuorumReplicate {
    network: Arc<dyn ExternalCommunication>,
    membership: Arc<dyn GroupMembership>,
    writes: QuorumPolicy,
    reads: QuorumPolicy,
    repair_reads: bool,
    handoff: Option<Arc<dyn HintedHandoff>>,
}

impl QuorumReplicate {
    pub fn new(
        network: Arc<dyn ExternalCommunication>,
        membership: Arc<dyn GroupMembership>,
        writes: QuorumPolicy,
        reads: QuorumPolicy,
        repair_reads: bool,
    ) -> Self {
        Self {
            network,
            membership,
            writes,
            reads,
            repair_reads,
            handoff: None,
        }
    }

    pub fn with_handoff(mut self, handoff: Arc<dyn HintedHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    fn fan_out(
        &self,
        targets: &[NodeInfo],
        request: &Request,
        timeout: Duration,
    ) -> (Receiver<Response>, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let cutoff = Arc::new(AtomicBool::new(false));

        for node in targets {
            let tx = tx.clone();
            let cutoff = Arc::clone(&cutoff);
            let (id, zone) = (node.id, node.zone);
            let sent_at = Instant::now();
            self.network.send(
                node,
                request.clone(),
                timeout,
                Box::new(move |result| {
                    if cutoff.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.send(Response {
                        node: id,
                        zone,
                        result,
                        elapsed: sent_at.elapsed(),
                    });
                }),
            );
        }
        (rx, cutoff)
    }

    /// Waits for answers and folds each into `meta` with `fold`. Returns the
    /// number of targets that never answered before cutoff.
    fn gather<F>(
        &self,
        meta: &mut MetaData,
        policy: &QuorumPolicy,
        targets: &[NodeInfo],
        request: &Request,
        timeout: Duration,
        mut fold: F,
    ) -> usize
    where
        F: FnMut(&mut MetaData, Response),
    {
        let deadline = meta.started_at + timeout;
        let per_request = deadline.saturating_duration_since(Instant::now());
        let (rx, cutoff) = self.fan_out(targets, request, per_request);
        let mut outstanding = targets.len();

        loop {
            if policy.is_satisfied(meta) && policy.is_preferred_reached(meta) {
                break;
            }
            if outstanding == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(response) => {
                    outstanding -= 1;
                    fold(meta, response);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        cutoff.store(true, Ordering::Release);
        while let Ok(response) = rx.try_recv() {
            outstanding = outstanding.saturating_sub(1);
            fold(meta, response);
        }
        outstanding
    }

    /// Shared classification of replica failures. Returns true when the
    /// answer counts as a success.
    fn classify(
        &self,
        report: &mut ReplicationReport,
        node: NodeId,
        error: ReplicaError,
        request: &Request,
    ) -> bool {
        if error.is_benign() {
            return true;
        }
        match error {
            ReplicaError::QuotaExceeded { .. } => {
                debug!(node, "replica over quota; handing off");
                if let (Some(handoff), Some(info)) = (&self.handoff, self.membership.node(node)) {
                    handoff.hint(&info, request);
                }
                report.hinted.push(node);
                false
            }
            error @ ReplicaError::InvalidMetadata { .. } => {
                warn!(node, %error, "replica reports stale routing");
                self.membership.request_metadata_refresh(node);
                report.failures.push((node, error));
                false
            }
            error => {
                debug!(node, %error, "replica failed");
                report.failures.push((node, error));
                false
            }
        }
    }

    fn check_operational(
        &self,
        policy: &QuorumPolicy,
        meta: &MetaData,
        targets: &[NodeInfo],
    ) -> EngineResult<()> {
        let available = policy.successes(meta) + targets.len();
        if available < policy.required() {
            return Err(EngineError::InsufficientOperationalNodes {
                required: policy.required(),
                available,
            });
        }
        Ok(())
    }

    fn finish(
        policy: &QuorumPolicy,
        meta: &MetaData,
        mut report: ReplicationReport,
        unanswered: usize,
    ) -> EngineResult<ReplicationReport> {
        report.successes = policy.successes(meta);
        report.zones = meta.zones.len();
        report.unanswered = unanswered;
        report.satisfied = policy.is_satisfied(meta);
        if report.satisfied {
            return Ok(report);
        }
        if unanswered > 0 {
            return Err(EngineError::Timeout {
                elapsed_ms: meta.started_at.elapsed().as_millis() as u64,
                successes: report.successes,
                required: policy.required(),
            });
        }
        Err(EngineError::InsufficientSuccesses {
            required: policy.required(),
            successes: report.successes,
            required_zones: policy.required_zones(),
            zones: report.zones,
        })
    }
}

impl Replicate for QuorumReplicate {
    fn replicate(
        &self,
        meta: &mut MetaData,
        request: Request,
        targets: Vec<NodeInfo>,
        timeout: Duration,
    ) -> EngineResult<ReplicationReport> {
        let policy = self.writes;
        self.check_operational(&policy, meta, &targets)?;

        let mut report = ReplicationReport::default();
        let unanswered = self.gather(meta, &policy, &targets, &request, timeout, |meta, response| {
            let result = match response.result {
                Ok(Reply::Rejected { error }) => Err(error),
                Ok(Reply::Failed { error }) => Err(ReplicaError::Unavailable {
                    node: response.node,
                    reason: error.to_string(),
                }),
                other => other,
            };
            let success = match result {
                Ok(_) => true,
                Err(error) => self.classify(&mut report, response.node, error, &request),
            };
            if success {
                meta.replicate_successes += 1;
                meta.zones.insert(response.zone);
            }
            debug!(
                node = response.node,
                success,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "replica answered"
            );
        });

        Self::finish(&policy, meta, report, unanswered)
    }

    fn read(
        &self,
        meta: &mut MetaData,
        key: &str,
        local: Vec<Versioned>,
        targets: Vec<NodeInfo>,
        timeout: Duration,
    ) -> EngineResult<ReadOutcome> {
        let policy = self.reads;
        self.check_operational(&policy, meta, &targets)?;

        let request = Request::Fetch {
            key: key.to_string(),
        };
        let mut report = ReplicationReport::default();
        let mut answers: Vec<(NodeId, Vec<Versioned>)> = Vec::new();
        let unanswered = self.gather(meta, &policy, &targets, &request, timeout, |meta, response| {
            match response.result {
                Ok(Reply::Values { versions }) => {
                    meta.get_successes += 1;
                    meta.zones.insert(response.zone);
                    answers.push((response.node, versions));
                }
                Ok(Reply::Rejected { error }) => {
                    self.classify(&mut report, response.node, error, &request);
                }
                Ok(other) => report.failures.push((
                    response.node,
                    ReplicaError::Unavailable {
                        node: response.node,
                        reason: format!("unexpected reply to fetch: {other:?}"),
                    },
                )),
                Err(error) => {
                    self.classify(&mut report, response.node, error, &request);
                }
            }
        });
        let report = Self::finish(&policy, meta, report, unanswered)?;

        let versions = reconcile(local.iter().chain(answers.iter().flat_map(|(_, v)| v)));
        let local_missing = missing_from(&local, &versions);
        let mut repaired = Vec::new();
        if self.repair_reads {
            for (node, held) in &answers {
                let missing = missing_from(held, &versions);
                if missing.is_empty() {
                    continue;
                }
                let Some(info) = self.membership.node(*node) else {
                    continue;
                };
                for versioned in missing {
                    self.network.notify(
                        &info,
                        Request::Replicate {
                            key: key.to_string(),
                            value: versioned.value,
                            version: versioned.version,
                            dependencies: Vec::new(),
                            origin: self.membership.node_id(),
                        },
                        timeout,
                    );
                }
                debug!(node, key, "read repair sent");
                repaired.push(*node);
            }
        }

        Ok(ReadOutcome {
            versions,
            local_missing,
            repaired,
            report,
        })
    }
}

/// The versions no other version dominates, one per distinct version.
pub fn reconcile<'a>(candidates: impl IntoIterator<Item = &'a Versioned>) -> Vec<Versioned> {
    let mut winners: Vec<Versioned> = Vec::new();
    for candidate in candidates {
        let dominated = winners.iter().any(|winner| {
            matches!(
                candidate.version.compare(&winner.version),
                VersionOrder::Before | VersionOrder::Tie
            )
        });
        if dominated {
            continue;
        }
        winners.retain(|winner| winner.version.compare(&candidate.version) != VersionOrder::Before);
        winners.push(candidate.clone());
    }
    winners
}

/// Winners that `held` has neither an equal nor a newer version of.
fn missing_from(held: &[Versioned], winners: &[Versioned]) -> Vec<Versioned> {
    winners
        .iter()
        .filter(|winner| {
            !held.iter().any(|have| {
                matches!(
                    have.version.compare(&winner.version),
                    VersionOrder::After | VersionOrder::Tie
                )
            })
        })
        .cloned()
        .collect()
}
