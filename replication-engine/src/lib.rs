//! Replication and consistency engine for a partitioned key-value store.
//!
//! Each key belongs to a partition replicated on several nodes spread over
//! failure zones. This crate is the layer between the network and a node's
//! local storage: it versions writes, decides when a replicated write may
//! become visible, and counts replica acknowledgements against quorum and
//! zone requirements.
//!
//! Two variants are selected at startup from [`config::ConsistencyMode`]:
//!
//! - **Causal**: writes carry a packed Lamport timestamp. A replicated write
//!   whose declared dependencies are not yet met is parked until they are.
//!   Clients are answered as soon as the write is local.
//! - **Quorum**: writes carry a vector clock, concurrent writes are kept as
//!   siblings, and clients are answered once enough replicas acknowledged.
//!
//! # Threading
//!
//! There is no central event loop. Every inbound message is handled on its
//! own thread (tokio's blocking pool under [`transport::serve`], a spawned
//! thread under [`network::InProcessNetwork`]). The dependency tables in
//! [`delivery`] are the only state shared between messages and sit behind a
//! single lock that is never held across network I/O.
//!
//! # Modules
//!
//! - [`version`]: version vectors and packed hybrid timestamps
//! - [`order`]: timestamping and the local causal clock
//! - [`delivery`]: causal admission of writes
//! - [`quorum`]: acknowledgement sufficiency
//! - [`replicate`]: fan-out with a bounded wait
//! - [`framework`]: per-message state machine
//! - [`membership`], [`storage`], [`communication`]: collaborator boundaries
//! - [`transport`], [`network`]: TCP and in-process peer fabrics

pub mod communication;
pub mod config;
pub mod delivery;
pub mod error;
pub mod framework;
pub mod membership;
pub mod message;
pub mod network;
pub mod order;
pub mod quorum;
pub mod replicate;
pub mod storage;
pub mod transport;
pub mod version;
