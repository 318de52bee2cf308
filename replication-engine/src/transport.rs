//! TCP transport speaking JSON lines.
//!
//! Every peer or client exchange is one connection carrying one [`Request`]
//! line followed by one [`Reply`] line. [`serve`] accepts connections and
//! hands each request to the [`Framework`] on tokio's blocking pool, since
//! a quorum write may wait on other replicas. [`TcpTransport`] is the
//! outbound side used as the framework's [`ExternalCommunication`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::select;
use tracing::{debug, info, warn};

use crate::communication::{ExternalCommunication, PeerCallback};
use crate::error::{EngineError, ReplicaError};
use crate::framework::Framework;
use crate::membership::NodeInfo;
use crate::message::{Reply, Request, read_message, write_message};

#[derive(Clone)]
pub struct TcpTransport {
    runtime: Handle,
}

impl TcpTransport {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current().context("tcp transport needs a tokio runtime")?;
        Ok(Self::new(runtime))
    }
}

impl ExternalCommunication for TcpTransport {
    fn send(&self, node: &NodeInfo, request: Request, timeout: Duration, callback: PeerCallback) {
        let address = node.address.clone();
        let target = node.id;
        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, client_request(&address, &request)).await
            {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(err)) => Err(ReplicaError::Unavailable {
                    node: target,
                    reason: format!("{err:#}"),
                }),
                Err(_) => Err(ReplicaError::Timeout { node: target }),
            };
            callback(result);
        });
    }
}

/// Sends one request to `address` and waits for its reply.
pub async fn client_request(address: &str, request: &Request) -> Result<Reply> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(&mut writer, request)
        .await
        .context("failed to send request")?;
    match read_message::<_, Reply>(&mut reader).await? {
        Some(reply) => Ok(reply),
        None => bail!("connection to {address} closed before a reply"),
    }
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, framework: Arc<Framework>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    let local = listener.local_addr()?;
    info!(node = framework.node_id(), %local, "listening");

    loop {
        select! {
            _ = &mut shutdown => {
                info!(node = framework.node_id(), "transport shutting down");
                break;
            }
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &framework);
            }
        }
    }

    Ok(())
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, framework: &Arc<Framework>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, framework),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, framework: &Arc<Framework>) {
    let framework = Arc::clone(framework);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, framework).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, framework: Arc<Framework>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, Request>(&mut reader).await? {
        debug!(key = request.key(), "request received");
        let worker = Arc::clone(&framework);
        let reply = match tokio::task::spawn_blocking(move || worker.submit(request)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = ?err, "request handler panicked");
                Reply::Failed {
                    error: EngineError::Shutdown,
                }
            }
        };
        write_message(&mut writer, &reply).await?;
    }

    Ok(())
}
