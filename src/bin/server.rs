//! Key-vault node binary.
//!
//! Runs a single node with separate ports for peer RPC and the client
//! API. Example 3-node cluster:
//!
//! ```text
//! keyvault-server --id 1 --rpc-port 8001 --api-port 9001 --data-dir /var/lib/kv1 \
//!     --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//! keyvault-server --id 2 --rpc-port 8002 --api-port 9002 --data-dir /var/lib/kv2 \
//!     --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//! keyvault-server --id 3 --rpc-port 8003 --api-port 9003 --data-dir /var/lib/kv3 \
//!     --peers 1=127.0.0.1:8001,2=127.0.0.1:8002
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::info;

use key_vault::api::{create_vault_router, VaultApiState};
use key_vault::core::config::RaftConfig;
use key_vault::core::raft_core::RaftCore;
use key_vault::core::raft_server::RaftServer;
use key_vault::metrics::create_metrics_router;
use key_vault::state_machine::vault::{KeyVault, SharedKeyVault};
use key_vault::storage::file::FileStorage;
use key_vault::transport::http::{create_rpc_router, HttpTransport};

#[derive(Parser, Debug)]
#[command(name = "keyvault-server", about = "Replicated key-value store node")]
struct Args {
    /// Unique node id within the cluster.
    #[arg(long)]
    id: u64,

    /// Port for peer-to-peer RPC (/raft/*).
    #[arg(long)]
    rpc_port: u16,

    /// Port for the client API (/vault/*, /metrics/*, ...).
    #[arg(long)]
    api_port: u16,

    /// Directory for durable state, scoped to this node.
    #[arg(long)]
    data_dir: String,

    /// Peer list as comma-separated id=host:port pairs,
    /// e.g. "2=127.0.0.1:8002,3=127.0.0.1:8003".
    #[arg(long, value_parser = parse_peers)]
    peers: PeerMap,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    heartbeat_ms: u64,

    /// Minimum election timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    election_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    #[arg(long, default_value_t = 6000)]
    election_max_ms: u64,

    /// Per-call peer RPC timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    rpc_timeout_ms: u64,

    /// Applied entries before an automatic snapshot (0 disables).
    #[arg(long, default_value_t = 10_000)]
    snapshot_threshold: u64,
}

#[derive(Debug, Clone)]
struct PeerMap(HashMap<u64, String>);

fn parse_peers(raw: &str) -> Result<PeerMap, String> {
    let mut peers = HashMap::new();
    for pair in raw.split(',').filter(|s| !s.is_empty()) {
        let (id, addr) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid peer spec '{}', expected id=host:port", pair))?;
        let id: u64 = id
            .parse()
            .map_err(|_| format!("invalid peer id in '{}'", pair))?;
        peers.insert(id, addr.to_string());
    }
    if peers.is_empty() {
        return Err("at least one peer is required".to_string());
    }
    Ok(PeerMap(peers))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let peers = args.peers.0;

    info!(
        "node {} starting: rpc port {}, api port {}, data dir {}",
        args.id, args.rpc_port, args.api_port, args.data_dir
    );
    info!("node {} peers: {:?}", args.id, peers);

    let storage = FileStorage::new(&args.data_dir).expect("failed to open data directory");
    let vault: SharedKeyVault = Arc::new(Mutex::new(KeyVault::new()));

    let peer_ids: Vec<u64> = peers.keys().copied().collect();
    let transport = HttpTransport::new(peers, Duration::from_millis(args.rpc_timeout_ms));

    let mut core = RaftCore::new(
        args.id,
        peer_ids,
        Box::new(storage),
        Box::new(vault.clone()),
    );
    core.set_snapshot_threshold(args.snapshot_threshold);

    let config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_min_ms),
            Duration::from_millis(args.election_max_ms),
        )
        .with_snapshot_threshold(args.snapshot_threshold);

    let (server, shared_core) = RaftServer::with_config(core, transport, config);
    let apply_notify = server.apply_notify();
    let metrics = server.metrics();
    let handle = server.start();

    let rpc_router = create_rpc_router(shared_core.clone(), apply_notify);
    let api_router = create_vault_router(VaultApiState {
        handle,
        core: shared_core,
        vault,
        metrics: metrics.clone(),
    })
    .merge(create_metrics_router(metrics));

    let rpc_addr: SocketAddr = format!("0.0.0.0:{}", args.rpc_port).parse().unwrap();
    let rpc_listener = tokio::net::TcpListener::bind(rpc_addr)
        .await
        .expect("failed to bind rpc port");
    info!("node {} rpc surface on {}", args.id, rpc_addr);
    tokio::spawn(async move {
        axum::serve(rpc_listener, rpc_router).await.unwrap();
    });

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse().unwrap();
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind api port");
    info!("node {} client api on {}", args.id, api_addr);
    axum::serve(api_listener, api_router).await.unwrap();
}
