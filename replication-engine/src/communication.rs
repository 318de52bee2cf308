//! Boundaries to the collaborators the core does not own.
//!
//! [`InternalCommunication`] is the local storage engine. [`ExternalCommunication`]
//! is the network: peer requests go out through it and their answers come
//! back through a [`PeerCallback`] run on the transport's own thread.

use std::time::Duration;

use tracing::debug;

use crate::error::ReplicaError;
use crate::membership::NodeInfo;
use crate::message::{Reply, Request, Responder};
use crate::version::{Version, Versioned};

/// Local single-node storage.
pub trait InternalCommunication: Send + Sync {
    /// Every sibling version stored for `key`. Empty when the key is unknown.
    fn get(&self, key: &str) -> Result<Vec<Versioned>, ReplicaError>;

    /// Stores `versioned`, dropping the siblings it dominates. Fails with
    /// [`ReplicaError::ObsoleteVersion`] when a stored version already
    /// dominates or equals it.
    fn put(&self, key: &str, versioned: Versioned) -> Result<(), ReplicaError>;

    /// Merge of all sibling versions, or `None` when nothing is stored.
    fn durable_version(&self, key: &str) -> Result<Option<Version>, ReplicaError> {
        let versions = self.get(key)?;
        Ok(versions
            .iter()
            .map(|versioned| &versioned.version)
            .fold(None, |acc: Option<Version>, version| {
                Some(match acc {
                    Some(acc) => acc.merge(version),
                    None => version.clone(),
                })
            }))
    }
}

/// Completion for a peer request. Must not block; may run on any thread.
pub type PeerCallback = Box<dyn FnOnce(Result<Reply, ReplicaError>) + Send + 'static>;

/// Peer and client messaging.
pub trait ExternalCommunication: Send + Sync {
    /// Sends `request` to `node` without blocking the caller. `callback` runs
    /// exactly once, with the peer's reply or the failure, on a transport
    /// thread.
    fn send(&self, node: &NodeInfo, request: Request, timeout: Duration, callback: PeerCallback);

    /// Fire-and-forget variant of [`send`](Self::send).
    fn notify(&self, node: &NodeInfo, request: Request, timeout: Duration) {
        let target = node.id;
        self.send(
            node,
            request,
            timeout,
            Box::new(move |result| {
                if let Err(error) = result {
                    debug!(node = target, %error, "notification not delivered");
                }
            }),
        );
    }

    fn reply_to_client(&self, responder: Responder, reply: Reply) {
        responder.send(reply);
    }
}
