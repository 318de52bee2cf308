//! Error taxonomy for the replication core.
//!
//! [`ReplicaError`] describes what a single replica answered; it crosses the
//! peer boundary so the replicate fold can tell stale routing from quota
//! pressure from a hard failure. [`EngineError`] is what an operation reports
//! to its caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::NodeId;

/// Outcome of one replica's attempt to serve a peer request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplicaError {
    /// The write is not newer than what the replica already holds.
    #[error("obsolete version for key {key}")]
    ObsoleteVersion { key: String },

    /// The replica's routing metadata disagrees with the sender's.
    #[error("invalid metadata at node {node}: {reason}")]
    InvalidMetadata { node: NodeId, reason: String },

    /// The replica refused the write for resource reasons.
    #[error("quota exceeded at node {node}")]
    QuotaExceeded { node: NodeId },

    #[error("node {node} unavailable: {reason}")]
    Unavailable { node: NodeId, reason: String },

    #[error("node {node} timed out")]
    Timeout { node: NodeId },

    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

impl ReplicaError {
    /// Obsolete-version answers mean the replica is already at least as new.
    pub fn is_benign(&self) -> bool {
        matches!(self, ReplicaError::ObsoleteVersion { .. })
    }
}

/// Failure of an externally visible operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    #[error("obsolete version for key {key}")]
    ObsoleteVersion { key: String },

    #[error("insufficient operational nodes: required {required}, available {available}")]
    InsufficientOperationalNodes { required: usize, available: usize },

    #[error(
        "insufficient successes: {successes}/{required} acks, {zones}/{required_zones} zones"
    )]
    InsufficientSuccesses {
        required: usize,
        successes: usize,
        required_zones: usize,
        zones: usize,
    },

    #[error("timed out after {elapsed_ms}ms with {successes}/{required} acks")]
    Timeout {
        elapsed_ms: u64,
        successes: usize,
        required: usize,
    },

    #[error("invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("node {node} is not authorized to timestamp key {key}")]
    NotAuthorized { key: String, node: NodeId },

    #[error("storage failure: {reason}")]
    Storage { reason: String },

    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("engine is shutting down")]
    Shutdown,
}

impl From<ReplicaError> for EngineError {
    fn from(err: ReplicaError) -> Self {
        match err {
            ReplicaError::ObsoleteVersion { key } => EngineError::ObsoleteVersion { key },
            ReplicaError::InvalidMetadata { node, reason } => EngineError::InvalidMetadata {
                reason: format!("node {node}: {reason}"),
            },
            ReplicaError::Storage { reason } => EngineError::Storage { reason },
            other => EngineError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
