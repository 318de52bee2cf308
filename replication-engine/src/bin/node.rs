use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use replication_engine::config::{ConsistencyMode, NodeFile};
use replication_engine::framework::Framework;
use replication_engine::membership::StaticMembership;
use replication_engine::message::{Dependency, Reply, Request};
use replication_engine::storage::MemoryStorage;
use replication_engine::transport::{TcpTransport, client_request, serve};
use replication_engine::version::{NodeId, Version};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replica, serving peers and clients over TCP.
    Serve(ServeArgs),
    /// Write a value.
    Put(PutArgs),
    /// Read every current version of a key.
    Get(KeyArgs),
    /// Write a tombstone for a key.
    Delete(KeyArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON file with `engine` and `cluster` sections.
    #[arg(long)]
    config: PathBuf,

    /// This node's id in the cluster.
    #[arg(long)]
    id: NodeId,

    /// Bind address. Defaults to the node's address in the cluster config.
    #[arg(long)]
    listen: Option<String>,

    /// Overrides the consistency mode from the config file.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Causal,
    Quorum,
}

impl From<Mode> for ConsistencyMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Causal => ConsistencyMode::Causal,
            Mode::Quorum => ConsistencyMode::Quorum,
        }
    }
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// Address of any replica.
    #[arg(long, default_value = "127.0.0.1:7100")]
    server: String,

    #[arg(long)]
    key: String,

    /// Dependency as KEY:NODE=COUNTER[,NODE=COUNTER...]. Repeatable.
    #[arg(long = "after", value_parser = parse_dependency)]
    dependencies: Vec<Dependency>,
}

#[derive(Args, Debug)]
struct PutArgs {
    #[command(flatten)]
    target: KeyArgs,

    #[arg(long)]
    value: String,
}

fn parse_dependency(raw: &str) -> Result<Dependency> {
    let Some((key, entries)) = raw.rsplit_once(':') else {
        bail!("expected KEY:NODE=COUNTER, got {raw}");
    };
    let mut parsed = Vec::new();
    for entry in entries.split(',') {
        let Some((node, counter)) = entry.split_once('=') else {
            bail!("expected NODE=COUNTER, got {entry}");
        };
        let node: NodeId = node.trim().parse().context("invalid node id")?;
        let counter: u64 = counter.trim().parse().context("invalid counter")?;
        parsed.push((node, counter));
    }
    Ok(Dependency::new(key, Version::from_entries(parsed)))
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Put(args) => {
            let request = Request::Put {
                key: args.target.key,
                value: args.value.into_bytes(),
                dependencies: args.target.dependencies,
            };
            print_reply(client_request(&args.target.server, &request).await?)?;
        }
        Command::Get(args) => {
            let request = Request::Get { key: args.key };
            print_reply(client_request(&args.server, &request).await?)?;
        }
        Command::Delete(args) => {
            let request = Request::Delete {
                key: args.key,
                dependencies: args.dependencies,
            };
            print_reply(client_request(&args.server, &request).await?)?;
        }
    }

    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let mut file = NodeFile::load(&args.config)?;
    if let Some(mode) = args.mode {
        file.engine.mode = mode.into();
    }

    let membership = Arc::new(StaticMembership::new(
        &file.cluster,
        args.id,
        file.engine.timestamper,
    )?);
    let listen = match args.listen {
        Some(listen) => listen,
        None => file
            .cluster
            .nodes
            .iter()
            .find(|node| node.id == args.id)
            .map(|node| node.address.clone())
            .context("node has no address in the cluster config")?,
    };

    let retention = file.engine.pending_retention();
    let framework = Arc::new(Framework::from_config(
        file.engine,
        membership,
        Arc::new(MemoryStorage::new(args.id)),
        Arc::new(TcpTransport::current()?),
    ));

    if let Some(retention) = retention {
        spawn_maintenance(Arc::clone(&framework), retention);
    }

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("node {} listening on {}", args.id, listener.local_addr()?);

    if let Err(err) = serve(listener, framework, shutdown_signal()).await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

fn spawn_maintenance(framework: Arc<Framework>, retention: Duration) {
    let period = (retention / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = framework.evict_expired();
            let stats = framework.stats();
            debug!(
                evicted,
                pending = stats.delivery.pending,
                remote_waiters = stats.delivery.remote_waiters,
                "maintenance pass"
            );
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}

fn print_reply(reply: Reply) -> Result<()> {
    match reply {
        Reply::Stored { version } => println!("stored at {version}"),
        Reply::Values { versions } if versions.is_empty() => println!("(not found)"),
        Reply::Values { versions } => {
            for versioned in versions {
                match versioned.value {
                    Some(value) => {
                        println!("{} @ {}", String::from_utf8_lossy(&value), versioned.version)
                    }
                    None => println!("(deleted) @ {}", versioned.version),
                }
            }
        }
        Reply::Ack => println!("ok"),
        Reply::Failed { error } => bail!("request failed: {error}"),
        Reply::Rejected { error } => bail!("request rejected: {error}"),
    }
    Ok(())
}
