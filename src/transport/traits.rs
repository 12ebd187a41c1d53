//! Transport abstraction for peer-to-peer RPC.

use std::fmt;

use async_trait::async_trait;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Transport over which a node reaches its peers. Every call carries a
/// per-call deadline enforced by the implementation; no call waits
/// unbounded.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer.
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer.
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer.
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Errors surfaced by transports. All are transient from the protocol's
/// point of view: the caller retries on the next heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the target node failed.
    ConnectionFailed,
    /// The request deadline elapsed.
    Timeout,
    /// The target node is not in the configured cluster.
    NodeNotFound,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionFailed => write!(f, "connection failed"),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::NodeNotFound => write!(f, "node not found"),
        }
    }
}
