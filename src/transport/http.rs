//! HTTP transport for peer-to-peer RPC.
//!
//! Outbound: reqwest client with a per-call timeout. Inbound: an axum
//! router exposing the `/raft/*` RPC surface against the shared core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use tokio::sync::{Mutex, Notify};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftCore,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// Shared reference to the consensus core.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// HTTP transport for outbound RPC.
pub struct HttpTransport {
    /// Map of node id to address, e.g. "127.0.0.1:8001".
    peers: HashMap<u64, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with peer addresses and a per-call timeout.
    /// The timeout must stay well below the election window so a dead
    /// peer cannot stall a heartbeat round into an election.
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        HttpTransport { peers, client }
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        target: u64,
        path: &str,
        args: &Req,
    ) -> Result<Resp, TransportError> {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post_json(target, "/raft/request-vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post_json(target, "/raft/append-entries", &args).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.post_json(target, "/raft/install-snapshot", &args).await
    }
}

/// State for the inbound RPC router: the shared core plus the applier
/// wake-up handle, so commit movement observed in a handler reaches the
/// applier task without applying inline.
#[derive(Clone)]
pub struct RpcState {
    pub core: SharedCore,
    pub apply_notify: Arc<Notify>,
}

/// Build the axum router for the peer RPC surface.
pub fn create_rpc_router(core: SharedCore, apply_notify: Arc<Notify>) -> Router {
    let state = RpcState { core, apply_notify };
    Router::new()
        .route("/raft/request-vote", post(handle_request_vote))
        .route("/raft/append-entries", post(handle_append_entries))
        .route("/raft/install-snapshot", post(handle_install_snapshot))
        .with_state(state)
}

async fn handle_request_vote(
    State(state): State<RpcState>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    let mut core = state.core.lock().await;
    Json(core.handle_request_vote(&args))
}

async fn handle_append_entries(
    State(state): State<RpcState>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    let output = {
        let mut core = state.core.lock().await;
        let output = core.handle_append_entries(&args);
        if core.commit_index > core.last_applied {
            state.apply_notify.notify_one();
        }
        output
    };
    Json(output.result)
}

async fn handle_install_snapshot(
    State(state): State<RpcState>,
    Json(args): Json<InstallSnapshotArgs>,
) -> Json<InstallSnapshotResult> {
    let mut core = state.core.lock().await;
    Json(core.handle_install_snapshot(&args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::RecordingStateMachine;
    use crate::storage::memory::MemoryStorage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn new_shared_core(id: u64, peers: Vec<u64>) -> SharedCore {
        Arc::new(Mutex::new(RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(RecordingStateMachine::new()),
        )))
    }

    fn rpc_request(path: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_vote_endpoint() {
        let core = new_shared_core(1, vec![2, 3]);
        let app = create_rpc_router(core.clone(), Arc::new(Notify::new()));

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let request = rpc_request("/raft/request-vote", serde_json::to_string(&args).unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let result: RequestVoteResult = serde_json::from_slice(&body).unwrap();
        assert!(result.vote_granted);
        assert_eq!(core.lock().await.voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_append_entries_endpoint_notifies_applier() {
        let core = new_shared_core(1, vec![2, 3]);
        let notify = Arc::new(Notify::new());
        let app = create_rpc_router(core.clone(), notify.clone());

        let entry = crate::core::raft_core::LogEntry {
            term: 1,
            index: 1,
            command: crate::core::command::Command::NoOp,
            created_at: 0,
            applied: false,
        };
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry],
            leader_commit: 1,
        };
        let request = rpc_request("/raft/append-entries", serde_json::to_string(&args).unwrap());

        // Arm a waiter before the request so the notification is observed.
        let waiter = notify.clone();
        let notified = tokio::spawn(async move { waiter.notified().await });

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let result: AppendEntriesResult = serde_json::from_slice(&body).unwrap();
        assert!(result.success);
        assert_eq!(result.match_index, 1);

        notified.await.unwrap();
        assert_eq!(core.lock().await.commit_index, 1);
    }

    #[tokio::test]
    async fn test_install_snapshot_endpoint() {
        use crate::state_machine::vault::KeyVault;
        use crate::state_machine::Snapshotable;

        let vault = KeyVault::new();
        let data = vault.snapshot().unwrap();

        let core = Arc::new(Mutex::new(RaftCore::new(
            1,
            vec![2],
            Box::new(MemoryStorage::new()),
            Box::new(KeyVault::new()),
        )));
        let app = create_rpc_router(core.clone(), Arc::new(Notify::new()));

        let args = InstallSnapshotArgs {
            term: 1,
            leader_id: 2,
            last_included_index: 5,
            last_included_term: 1,
            offset: 0,
            data,
            done: true,
        };
        let request = rpc_request(
            "/raft/install-snapshot",
            serde_json::to_string(&args).unwrap(),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let result: InstallSnapshotResult = serde_json::from_slice(&body).unwrap();
        assert!(matches!(result, InstallSnapshotResult::Success { .. }));
        assert_eq!(core.lock().await.snapshot_last_index, 5);
    }
}
