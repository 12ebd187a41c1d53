//! Client-facing key-value API and operational endpoints.
//!
//! Leader-only surface: writes become log entries and are acknowledged
//! `202 PENDING` with their log index; reads are answered from the state
//! machine after a majority heartbeat round re-confirms leadership.
//! Followers answer `403` with a best-effort leader hint.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::command::Command;
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftError, RaftHandle};
use crate::core::raft_core::NodeRole;
use crate::metrics::SharedMetrics;
use crate::state_machine::vault::SharedKeyVault;

/// Replication progress reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationStatus {
    Pending,
    Replicated,
    NotReplicated,
}

/// Body of `PUT /vault/key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueRequest {
    pub key: String,
    pub value: String,
}

/// Response envelope for the `/vault` surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueResponse {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<u64>,
    pub term: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_status: Option<ReplicationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_index: Option<u64>,
}

impl KeyValueResponse {
    fn bare(key: String, term: u64) -> Self {
        Self {
            key,
            value: None,
            found: false,
            leader_id: None,
            term,
            message: String::new(),
            replication_status: None,
            log_index: None,
            commit_index: None,
            last_applied_index: None,
        }
    }
}

/// Response of `GET /raft/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStateResponse {
    pub node_id: u64,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub log_length: u64,
    pub snapshot_index: u64,
}

/// Response of the `/snapshots` surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfoResponse {
    pub found: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_included_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_included_term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Shared state for the client API handlers.
#[derive(Clone)]
pub struct VaultApiState {
    /// Handle into the coordinator for writes, read confirmation, and
    /// snapshot triggers.
    pub handle: RaftHandle,
    /// Shared core for role/term/progress queries.
    pub core: SharedCore,
    /// The vault itself, for leader reads.
    pub vault: SharedKeyVault,
    pub metrics: SharedMetrics,
}

/// Build the client + operational router.
pub fn create_vault_router(state: VaultApiState) -> Router {
    Router::new()
        .route("/vault/key", put(handle_put_key))
        .route("/vault/key/:key", get(handle_get_key).delete(handle_delete_key))
        .route("/vault/all", get(handle_get_all))
        .route("/health", get(handle_health))
        .route("/raft/state", get(handle_raft_state))
        .route("/snapshots/latest", get(handle_latest_snapshot))
        .route("/snapshots/create", post(handle_create_snapshot))
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "OK"
}

/// PUT /vault/key: append a Put to the leader's log.
async fn handle_put_key(
    State(state): State<VaultApiState>,
    Json(request): Json<KeyValueRequest>,
) -> (StatusCode, Json<KeyValueResponse>) {
    let started = Instant::now();
    let key = request.key.clone();
    let command = Command::Put {
        key: request.key,
        value: request.value.clone(),
    };

    match state.handle.submit(command).await {
        Ok(receipt) => {
            let latency = started.elapsed().as_millis() as u64;
            state.metrics.record_write_request(&key, "PENDING", latency);
            debug!("accepted PUT {} at log index {}", key, receipt.log_index);

            let mut response = KeyValueResponse::bare(key, receipt.term);
            response.value = Some(request.value);
            response.found = true;
            response.leader_id = Some(node_id(&state).await);
            response.message = "key replication initiated".to_string();
            response.replication_status = Some(ReplicationStatus::Pending);
            response.log_index = Some(receipt.log_index);
            (StatusCode::ACCEPTED, Json(response))
        }
        Err(err) => {
            let latency = started.elapsed().as_millis() as u64;
            state
                .metrics
                .record_write_request(&key, "REJECTED_NOT_LEADER", latency);
            not_leader_response(&state, key, err).await
        }
    }
}

/// DELETE /vault/key/{key}: append a Delete to the leader's log.
async fn handle_delete_key(
    State(state): State<VaultApiState>,
    Path(key): Path<String>,
) -> (StatusCode, Json<KeyValueResponse>) {
    let started = Instant::now();
    let command = Command::Delete { key: key.clone() };

    match state.handle.submit(command).await {
        Ok(receipt) => {
            let latency = started.elapsed().as_millis() as u64;
            state.metrics.record_write_request(&key, "PENDING", latency);

            let mut response = KeyValueResponse::bare(key, receipt.term);
            response.found = true;
            response.leader_id = Some(node_id(&state).await);
            response.message = "key deletion initiated".to_string();
            response.replication_status = Some(ReplicationStatus::Pending);
            response.log_index = Some(receipt.log_index);
            (StatusCode::ACCEPTED, Json(response))
        }
        Err(err) => {
            let latency = started.elapsed().as_millis() as u64;
            state
                .metrics
                .record_write_request(&key, "REJECTED_NOT_LEADER", latency);
            not_leader_response(&state, key, err).await
        }
    }
}

/// GET /vault/key/{key}: leader read, gated on leadership confirmation.
async fn handle_get_key(
    State(state): State<VaultApiState>,
    Path(key): Path<String>,
) -> (StatusCode, Json<KeyValueResponse>) {
    let started = Instant::now();

    {
        let core = state.core.lock().await;
        if core.role != NodeRole::Leader {
            let latency = started.elapsed().as_millis() as u64;
            state
                .metrics
                .record_read_request(&key, "REJECTED_NOT_LEADER", latency);

            let mut response = KeyValueResponse::bare(key, core.current_term);
            response.leader_id = core.current_leader;
            response.message = "reads only served by leader".to_string();
            return (StatusCode::FORBIDDEN, Json(response));
        }
    }

    // A heartbeat round must succeed after the read arrived, otherwise a
    // deposed leader could serve stale data.
    if !state.handle.confirm_leadership().await {
        let latency = started.elapsed().as_millis() as u64;
        state
            .metrics
            .record_read_request(&key, "REJECTED_NOT_LEADER", latency);

        let core = state.core.lock().await;
        let mut response = KeyValueResponse::bare(key, core.current_term);
        response.leader_id = core.current_leader.filter(|&id| id != core.id);
        response.message = "leadership could not be confirmed".to_string();
        return (StatusCode::FORBIDDEN, Json(response));
    }

    let value = state.vault.lock().unwrap().get(&key);
    let latency = started.elapsed().as_millis() as u64;
    let core = state.core.lock().await;

    let mut response = KeyValueResponse::bare(key.clone(), core.current_term);
    response.leader_id = Some(core.id);
    response.commit_index = Some(core.commit_index);
    response.last_applied_index = Some(core.last_applied);

    match value {
        Some(value) => {
            state.metrics.record_read_request(&key, "SUCCESS", latency);
            response.value = Some(value);
            response.found = true;
            response.message = "key retrieved successfully".to_string();
            (StatusCode::OK, Json(response))
        }
        None => {
            state.metrics.record_read_request(&key, "NOT_FOUND", latency);
            response.message = "key not found".to_string();
            (StatusCode::NOT_FOUND, Json(response))
        }
    }
}

/// GET /vault/all: full table dump (leader-only, debug).
async fn handle_get_all(
    State(state): State<VaultApiState>,
) -> Result<Json<std::collections::HashMap<String, String>>, (StatusCode, Json<KeyValueResponse>)>
{
    {
        let core = state.core.lock().await;
        if core.role != NodeRole::Leader {
            let mut response = KeyValueResponse::bare(String::new(), core.current_term);
            response.leader_id = core.current_leader;
            response.message = "reads only served by leader".to_string();
            return Err((StatusCode::FORBIDDEN, Json(response)));
        }
    }

    let all = state.vault.lock().unwrap().all();
    Ok(Json(all))
}

/// GET /raft/state: role, term, and progress counters.
async fn handle_raft_state(State(state): State<VaultApiState>) -> Json<RaftStateResponse> {
    let core = state.core.lock().await;
    Json(RaftStateResponse {
        node_id: core.id,
        role: format!("{:?}", core.role),
        term: core.current_term,
        leader_id: core.current_leader,
        commit_index: core.commit_index,
        last_applied_index: core.last_applied,
        log_length: core.log.len() as u64,
        snapshot_index: core.snapshot_last_index,
    })
}

/// GET /snapshots/latest: metadata of the newest persisted snapshot.
async fn handle_latest_snapshot(
    State(state): State<VaultApiState>,
) -> (StatusCode, Json<SnapshotInfoResponse>) {
    let core = state.core.lock().await;
    match core.load_snapshot() {
        Ok(Some(snapshot)) => (
            StatusCode::OK,
            Json(SnapshotInfoResponse {
                found: true,
                message: "latest snapshot retrieved".to_string(),
                last_included_index: Some(snapshot.metadata.last_included_index),
                last_included_term: Some(snapshot.metadata.last_included_term),
                created_term: Some(snapshot.metadata.created_term),
                size_bytes: Some(snapshot.data.len() as u64),
            }),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(SnapshotInfoResponse {
                found: false,
                message: "no snapshot available".to_string(),
                last_included_index: None,
                last_included_term: None,
                created_term: None,
                size_bytes: None,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SnapshotInfoResponse {
                found: false,
                message: format!("failed to load snapshot: {}", e),
                last_included_index: None,
                last_included_term: None,
                created_term: None,
                size_bytes: None,
            }),
        ),
    }
}

/// POST /snapshots/create: take a snapshot now.
async fn handle_create_snapshot(
    State(state): State<VaultApiState>,
) -> (StatusCode, Json<SnapshotInfoResponse>) {
    match state.handle.take_snapshot().await {
        Ok(metadata) => {
            state
                .metrics
                .record_snapshot_created(metadata.last_included_index, metadata.created_term);
            (
                StatusCode::OK,
                Json(SnapshotInfoResponse {
                    found: true,
                    message: "snapshot created".to_string(),
                    last_included_index: Some(metadata.last_included_index),
                    last_included_term: Some(metadata.last_included_term),
                    created_term: Some(metadata.created_term),
                    size_bytes: None,
                }),
            )
        }
        Err(err) => {
            let message = match err {
                RaftError::Snapshot(msg) => msg,
                other => format!("{:?}", other),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SnapshotInfoResponse {
                    found: false,
                    message,
                    last_included_index: None,
                    last_included_term: None,
                    created_term: None,
                    size_bytes: None,
                }),
            )
        }
    }
}

async fn node_id(state: &VaultApiState) -> u64 {
    state.core.lock().await.id
}

async fn not_leader_response(
    state: &VaultApiState,
    key: String,
    err: RaftError,
) -> (StatusCode, Json<KeyValueResponse>) {
    let core = state.core.lock().await;
    let leader_hint = match err {
        RaftError::NotLeader { leader_hint } => leader_hint.or(core.current_leader),
        _ => core.current_leader,
    };

    let mut response = KeyValueResponse::bare(key, core.current_term);
    response.leader_id = leader_hint;
    response.message = "this node is not the leader, write rejected".to_string();
    response.replication_status = Some(ReplicationStatus::NotReplicated);
    (StatusCode::FORBIDDEN, Json(response))
}
