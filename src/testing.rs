//! Testing utilities: an in-process cluster over real HTTP sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::{create_vault_router, RaftStateResponse, VaultApiState};
use crate::core::config::RaftConfig;
use crate::core::raft_core::RaftCore;
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::metrics::create_metrics_router;
use crate::state_machine::vault::{KeyVault, SharedKeyVault};
use crate::storage::memory::MemoryStorage;
use crate::transport::http::{create_rpc_router, HttpTransport};

/// One node of a test cluster.
pub struct TestNode {
    pub id: u64,
    /// Address serving both the RPC and client surfaces.
    pub addr: SocketAddr,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    pub raft_handle: RaftHandle,
    pub vault: SharedKeyVault,
    pub shared_core: SharedCore,
}

impl TestNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// An in-process cluster over real sockets.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start a 3-node cluster with test-friendly timing.
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    pub async fn with_nodes_and_config(count: usize, config: Option<RaftConfig>) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();

        // Bind every listener first so all addresses are known.
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        // Tight timing so elections and failover settle quickly. The RPC
        // timeout stays well below the election floor so one dead peer
        // cannot stretch a heartbeat round past it.
        let config = config.unwrap_or_else(|| {
            RaftConfig::default()
                .with_heartbeat_interval(Duration::from_millis(50))
                .with_election_timeout(Duration::from_millis(600), Duration::from_millis(1200))
        });

        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let peers: HashMap<u64, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();
            let peer_ids: Vec<u64> = peers.keys().copied().collect();

            let vault: SharedKeyVault = Arc::new(Mutex::new(KeyVault::new()));
            let transport = HttpTransport::new(peers, Duration::from_millis(300));

            let mut core = RaftCore::new(
                id,
                peer_ids,
                Box::new(MemoryStorage::new()),
                Box::new(vault.clone()),
            );
            core.set_snapshot_threshold(config.snapshot_threshold);

            let (server, shared_core) = RaftServer::with_config(core, transport, config.clone());
            let apply_notify = server.apply_notify();
            let metrics = server.metrics();
            let raft_handle = server.start();

            let app = build_router(
                shared_core.clone(),
                raft_handle.clone(),
                vault.clone(),
                apply_notify,
                metrics,
            );

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                raft_handle,
                vault,
                shared_core,
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        TestCluster { nodes }
    }

    /// Shut down every node.
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
            node.raft_handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Shut down one node (HTTP surface and coordinator), simulating a
    /// crash.
    pub async fn shutdown_node(&mut self, index: usize) {
        if let Some(tx) = self.nodes[index].http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.nodes[index].raft_handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn node_addr(&self, index: usize) -> SocketAddr {
        self.nodes[index].addr()
    }

    pub fn all_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.addr()).collect()
    }

    /// Index of the node at `addr`.
    pub fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|n| n.addr == addr)
    }

    /// Wait until some live node reports itself Leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<SocketAddr> {
        let start = std::time::Instant::now();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        while start.elapsed() < timeout {
            for node in &self.nodes {
                if node.http_shutdown_tx.is_none() {
                    continue;
                }
                if let Some(state) = fetch_state(&client, &node.addr).await {
                    if state.role == "Leader" {
                        return Some(node.addr);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    /// Address of a live node currently reporting Follower.
    pub async fn find_follower(&self) -> Option<SocketAddr> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        for node in &self.nodes {
            if node.http_shutdown_tx.is_none() {
                continue;
            }
            if let Some(state) = fetch_state(&client, &node.addr).await {
                if state.role == "Follower" {
                    return Some(node.addr);
                }
            }
        }
        None
    }
}

async fn fetch_state(client: &reqwest::Client, addr: &SocketAddr) -> Option<RaftStateResponse> {
    client
        .get(format!("http://{}/raft/state", addr))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()
}

fn build_router(
    shared_core: SharedCore,
    raft_handle: RaftHandle,
    vault: SharedKeyVault,
    apply_notify: Arc<tokio::sync::Notify>,
    metrics: crate::metrics::SharedMetrics,
) -> Router {
    let rpc_router = create_rpc_router(shared_core.clone(), apply_notify);
    let api_router = create_vault_router(VaultApiState {
        handle: raft_handle,
        core: shared_core,
        vault,
        metrics: metrics.clone(),
    });
    rpc_router.merge(api_router).merge(create_metrics_router(metrics))
}
