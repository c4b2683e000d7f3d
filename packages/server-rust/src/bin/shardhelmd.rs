//! Coordinator daemon.
//!
//! Wires the topology store, the admin clients, the background engines, and
//! the admin API together, then serves until SIGINT/SIGTERM or the shutdown
//! RPC.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use shardhelm_server::clients::{ProxyApiClient, SentinelApiClient, ServerApiClient};
use shardhelm_server::coordinator::{
    CoordConfig, Coordinator, MigrationRunnable, PollRunnable, ReplicationRunnable, TickWorker,
};
use shardhelm_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use shardhelm_server::store::{MemoryStore, TopologyStore};
use shardhelm_server::telemetry::{self, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "shardhelmd", version, about = "Cluster topology coordinator")]
struct Args {
    /// Cluster name this coordinator governs.
    #[arg(long, env = "SHARDHELM_CLUSTER")]
    cluster: String,

    /// Address to bind the admin API on.
    #[arg(long, env = "SHARDHELM_LISTEN", default_value = "0.0.0.0:18080")]
    listen: SocketAddr,

    /// Advertised admin address, when it differs from the bind address.
    #[arg(long, env = "SHARDHELM_ADVERTISE")]
    advertise: Option<String>,

    /// Topology database path. Uses a volatile in-memory store when absent.
    #[arg(long, env = "SHARDHELM_DATA")]
    data: Option<PathBuf>,

    /// Prometheus scrape address. Metrics are disabled when absent.
    #[arg(long, env = "SHARDHELM_METRICS")]
    metrics: Option<SocketAddr>,

    /// Log output format: pretty or json.
    #[arg(long, env = "SHARDHELM_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// PEM certificate chain; TLS needs both this and the key.
    #[arg(long, env = "SHARDHELM_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "SHARDHELM_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Concurrent slot migrations per engine tick.
    #[arg(long, env = "SHARDHELM_MIGRATION_PARALLEL", default_value_t = 100)]
    migration_parallel: usize,
}

fn open_store(path: Option<&PathBuf>) -> anyhow::Result<Arc<dyn TopologyStore>> {
    match path {
        #[cfg(feature = "redb")]
        Some(path) => Ok(Arc::new(shardhelm_server::store::RedbStore::open(path)?)),
        #[cfg(not(feature = "redb"))]
        Some(_) => anyhow::bail!("this build has no redb support; rebuild with --features redb"),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loglevel = telemetry::init_tracing(args.log_format)?;
    if let Some(listen) = args.metrics {
        telemetry::install_metrics(listen)?;
    }

    let advertise = args
        .advertise
        .clone()
        .unwrap_or_else(|| args.listen.to_string());
    let mut config = CoordConfig::new(&args.cluster, &advertise);
    config.migration_parallel = args.migration_parallel;
    let probe_timeout = config.probe_timeout;

    let store = open_store(args.data.as_ref())?;
    let servers = Arc::new(ServerApiClient::new(probe_timeout)?);
    let proxies = Arc::new(ProxyApiClient::new(&args.cluster, probe_timeout)?);
    let sentinels = Arc::new(SentinelApiClient::new(probe_timeout)?);

    let coordinator: Arc<Coordinator> =
        Coordinator::bootstrap(config, store, servers, proxies, sentinels).await?;
    info!(
        cluster = %args.cluster,
        version = coordinator.cached().version,
        "topology loaded"
    );

    let engine_interval = coordinator.config().engine_interval;
    let poll_interval = coordinator.config().poll_interval;
    let mut migration = TickWorker::start(
        MigrationRunnable::new(Arc::clone(&coordinator)),
        engine_interval,
    );
    let mut replication = TickWorker::start(
        ReplicationRunnable::new(Arc::clone(&coordinator)),
        engine_interval,
    );
    let mut poller = TickWorker::start(PollRunnable::new(Arc::clone(&coordinator)), poll_interval);

    let network_config = NetworkConfig {
        host: args.listen.ip().to_string(),
        port: args.listen.port(),
        tls: match (args.tls_cert, args.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        },
        ..NetworkConfig::default()
    };
    let mut network = NetworkModule::new(network_config, Arc::clone(&coordinator), loglevel);
    let port = network.start().await?;
    info!(cluster = %args.cluster, port, "admin API up");

    let controller = network.shutdown_controller();
    let signal_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_controller.trigger_shutdown();
    });

    let mut stop = controller.shutdown_receiver();
    network
        .serve(async move {
            let _ = stop.changed().await;
        })
        .await?;

    poller.stop().await;
    replication.stop().await;
    migration.stop().await;
    info!("coordinator stopped");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("SIGINT received"),
        () = terminate => info!("SIGTERM received"),
    }
}
