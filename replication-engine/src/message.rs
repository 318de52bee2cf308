//! Requests, replies, and the per-request scratch state threaded through the
//! pipeline.
//!
//! Client and peer traffic share one JSON line protocol: each frame is a
//! [`Request`] or [`Reply`] serialised as a single line. Inside a node a
//! request becomes a [`Message`]: the operation kind, the [`Content`] it
//! concerns, and a fresh [`MetaData`] owned by the request's processing path.

use std::collections::BTreeSet;
use std::io;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, ReplicaError};
use crate::version::{NodeId, Version, Versioned};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Opaque key. The core only needs equality and hashing.
pub type Key = String;

/// Opaque payload.
pub type Value = Vec<u8>;

/// Failure domain identifier (a datacenter or rack).
pub type ZoneId = u16;

/// "This write is not visible until `key` has reached at least `version`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub key: Key,
    pub version: Version,
}

impl Dependency {
    pub fn new(key: impl Into<Key>, version: Version) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

/// A dependency a remote node asked this node to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub key: Key,
    pub version: Version,
    pub requester: NodeId,
}

/// The key/value pair an operation concerns. `value` is `None` for reads and
/// deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub key: Key,
    pub value: Option<Value>,
}

impl Content {
    pub fn new(key: impl Into<Key>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Put,
    Get,
    Delete,
    Replicate,
    DependencyRequest,
    DependencyResponse,
    /// Replica-local read on behalf of a peer's quorum GET.
    Fetch,
}

/// Sends exactly one reply back to whoever issued a request.
///
/// `send` consumes the responder, so a request cannot be answered twice.
#[derive(Debug)]
pub struct Responder {
    tx: Sender<Reply>,
}

impl Responder {
    /// A responder and the receiving end its single reply will arrive on.
    pub fn channel() -> (Self, Receiver<Reply>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    pub fn send(self, reply: Reply) {
        // The requester may have given up waiting; nothing to do then.
        let _ = self.tx.send(reply);
    }
}

/// Per-request scratch state. Created when a request arrives, owned by that
/// request's processing path, and dropped once the reply is sent.
#[derive(Debug)]
pub struct MetaData {
    pub request_id: String,
    /// The working version: assigned by the clock for local writes, carried
    /// in for replicated writes and dependency traffic.
    pub version: Option<Version>,
    pub get_successes: usize,
    pub put_successes: usize,
    pub delete_successes: usize,
    pub replicate_successes: usize,
    pub dependencies: Vec<Dependency>,
    /// Dependencies not yet satisfied locally.
    pub remaining_dependencies: Vec<Dependency>,
    /// Zones that have acknowledged.
    pub zones: BTreeSet<ZoneId>,
    /// Peer that sent this message, for replicated and dependency traffic.
    pub origin: Option<NodeId>,
    pub started_at: Instant,
    pub reply_to: Option<Responder>,
}

impl MetaData {
    pub fn new(reply_to: Option<Responder>) -> Self {
        Self {
            request_id: nanoid::nanoid!(10),
            version: None,
            get_successes: 0,
            put_successes: 0,
            delete_successes: 0,
            replicate_successes: 0,
            dependencies: Vec::new(),
            remaining_dependencies: Vec::new(),
            zones: BTreeSet::new(),
            origin: None,
            started_at: Instant::now(),
            reply_to,
        }
    }

    /// Acknowledgements counted toward the write quorum of a PUT or DELETE.
    pub fn write_successes(&self) -> usize {
        self.put_successes + self.delete_successes
    }
}

/// One unit of work for the framework.
#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub content: Content,
    pub meta: MetaData,
}

impl Message {
    /// Converts a wire request into a message answered through `reply_to`.
    pub fn from_request(request: Request, reply_to: Option<Responder>) -> Self {
        let mut meta = MetaData::new(reply_to);
        let (kind, content) = match request {
            Request::Put {
                key,
                value,
                dependencies,
            } => {
                meta.dependencies = dependencies;
                (MessageKind::Put, Content::new(key, Some(value)))
            }
            Request::Get { key } => (MessageKind::Get, Content::new(key, None)),
            Request::Fetch { key } => (MessageKind::Fetch, Content::new(key, None)),
            Request::Delete { key, dependencies } => {
                meta.dependencies = dependencies;
                (MessageKind::Delete, Content::new(key, None))
            }
            Request::Replicate {
                key,
                value,
                version,
                dependencies,
                origin,
            } => {
                meta.version = Some(version);
                meta.dependencies = dependencies;
                meta.origin = Some(origin);
                (MessageKind::Replicate, Content::new(key, value))
            }
            Request::DependencyRequest {
                key,
                version,
                requester,
            } => {
                meta.version = Some(version);
                meta.origin = Some(requester);
                (MessageKind::DependencyRequest, Content::new(key, None))
            }
            Request::DependencyResponse { key, version } => {
                meta.version = Some(version);
                (MessageKind::DependencyResponse, Content::new(key, None))
            }
        };
        Self {
            kind,
            content,
            meta,
        }
    }
}

/// A frame sent by a client or a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Put {
        key: Key,
        value: Value,
        #[serde(default)]
        dependencies: Vec<Dependency>,
    },
    Get {
        key: Key,
    },
    Delete {
        key: Key,
        #[serde(default)]
        dependencies: Vec<Dependency>,
    },
    Replicate {
        key: Key,
        value: Option<Value>,
        version: Version,
        #[serde(default)]
        dependencies: Vec<Dependency>,
        origin: NodeId,
    },
    /// Replica-local read issued by a quorum GET.
    Fetch {
        key: Key,
    },
    DependencyRequest {
        key: Key,
        version: Version,
        requester: NodeId,
    },
    DependencyResponse {
        key: Key,
        version: Version,
    },
}

impl Request {
    pub fn key(&self) -> &str {
        match self {
            Request::Put { key, .. }
            | Request::Get { key }
            | Request::Delete { key, .. }
            | Request::Replicate { key, .. }
            | Request::Fetch { key }
            | Request::DependencyRequest { key, .. }
            | Request::DependencyResponse { key, .. } => key,
        }
    }
}

/// A frame sent back in answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// A PUT or DELETE succeeded at `version`.
    Stored { version: Version },
    /// Every sibling version currently held for the key.
    Values { versions: Vec<Versioned> },
    /// A peer accepted a replicated write or dependency message.
    Ack,
    /// A client operation failed.
    Failed { error: EngineError },
    /// A peer operation failed at the replica.
    Rejected { error: ReplicaError },
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replicate_frame_survives_the_wire() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = tokio::io::BufReader::new(reader);
        let request = Request::Replicate {
            key: "k".into(),
            value: Some(b"v1".to_vec()),
            version: Version::from_entries([(0, 3), (2, 1)]),
            dependencies: vec![Dependency::new("dep", Version::from_entries([(1, 5)]))],
            origin: 0,
        };

        write_message(&mut writer, &request)
            .await
            .expect("write message");
        let parsed = read_message::<_, Request>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(request, parsed);
    }

    #[test]
    fn put_request_without_dependencies_parses() {
        let parsed: Request =
            serde_json::from_str(r#"{"type":"put","key":"a","value":[104,105]}"#)
                .expect("parse put");
        assert_eq!(
            parsed,
            Request::Put {
                key: "a".into(),
                value: b"hi".to_vec(),
                dependencies: vec![],
            }
        );
    }

    #[test]
    fn responder_delivers_a_single_reply() {
        let (responder, rx) = Responder::channel();
        let meta = MetaData::new(Some(responder));
        assert_eq!(meta.request_id.len(), 10);
        if let Some(responder) = meta.reply_to {
            responder.send(Reply::Ack);
        }
        assert_eq!(rx.try_recv().ok(), Some(Reply::Ack));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replicate_request_populates_metadata() {
        let version = Version::from_entries([(4, 9)]);
        let message = Message::from_request(
            Request::Replicate {
                key: "k".into(),
                value: None,
                version: version.clone(),
                dependencies: vec![],
                origin: 4,
            },
            None,
        );
        assert_eq!(message.kind, MessageKind::Replicate);
        assert_eq!(message.meta.version, Some(version));
        assert_eq!(message.meta.origin, Some(4));
        assert_eq!(message.content.value, None);
    }
}
