//! In-memory peer fabric.
//!
//! [`InProcessNetwork`] connects several [`Framework`]s living in one process.
//! Each `send` runs on its own thread, so callbacks arrive concurrently just
//! as they would from a socket transport. Per-node [`Fault`]s make a peer
//! drop, delay, or fail the requests sent to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::communication::{ExternalCommunication, PeerCallback};
use crate::error::ReplicaError;
use crate::framework::Framework;
use crate::membership::NodeInfo;
use crate::message::{Reply, Request};
use crate::version::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The request is lost; the sender sees a timeout once it expires.
    Drop,
    /// The request is delivered and answered after the delay, even if the
    /// sender has stopped waiting by then.
    Delay(Duration),
    /// The request is refused with this error without being delivered.
    Fail(ReplicaError),
}

#[derive(Default)]
struct Fabric {
    nodes: RwLock<HashMap<NodeId, Weak<Framework>>>,
    faults: Mutex<HashMap<NodeId, Fault>>,
    delivered: Mutex<HashMap<NodeId, usize>>,
}

impl Fabric {
    fn deliver(&self, node: NodeId, request: Request) -> Result<Reply, ReplicaError> {
        let target = self.nodes.read().get(&node).and_then(Weak::upgrade);
        let Some(framework) = target else {
            return Err(ReplicaError::Unavailable {
                node,
                reason: "not registered".to_string(),
            });
        };
        *self.delivered.lock().entry(node).or_default() += 1;
        Ok(framework.submit(request))
    }
}

#[derive(Clone, Default)]
pub struct InProcessNetwork {
    fabric: Arc<Fabric>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, framework: &Arc<Framework>) {
        self.fabric
            .nodes
            .write()
            .insert(framework.node_id(), Arc::downgrade(framework));
    }

    pub fn set_fault(&self, node: NodeId, fault: Fault) {
        self.fabric.faults.lock().insert(node, fault);
    }

    pub fn heal(&self, node: NodeId) {
        self.fabric.faults.lock().remove(&node);
    }

    /// Requests that reached `node` so far.
    pub fn delivered(&self, node: NodeId) -> usize {
        self.fabric.delivered.lock().get(&node).copied().unwrap_or(0)
    }
}

impl ExternalCommunication for InProcessNetwork {
    fn send(&self, node: &NodeInfo, request: Request, timeout: Duration, callback: PeerCallback) {
        let fault = self.fabric.faults.lock().get(&node.id).cloned();
        let fabric = Arc::clone(&self.fabric);
        let target = node.id;
        trace!(node = target, key = request.key(), "in-process send");

        thread::spawn(move || match fault {
            Some(Fault::Fail(error)) => callback(Err(error)),
            Some(Fault::Drop) => {
                thread::sleep(timeout);
                callback(Err(ReplicaError::Timeout { node: target }));
            }
            Some(Fault::Delay(delay)) => {
                thread::sleep(delay);
                callback(fabric.deliver(target, request));
            }
            None => callback(fabric.deliver(target, request)),
        });
    }
}
