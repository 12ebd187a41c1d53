//! In-memory transport for testing.
//!
//! Each node owns an mpsc request channel; RPCs are delivered as messages
//! carrying a oneshot reply slot. An optional timeout models lost peers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftCore,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// Request messages delivered to a node.
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
    InstallSnapshot {
        args: InstallSnapshotArgs,
        reply: oneshot::Sender<InstallSnapshotResult>,
    },
}

/// Channel-based transport.
pub struct InMemoryTransport {
    /// Senders to each peer's request channel.
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional per-call timeout.
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            timeout: None,
        }
    }

    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            senders,
            timeout: Some(timeout),
        }
    }

    async fn call<R>(
        &self,
        target: u64,
        make_request: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, |reply| Request::RequestVote { args, reply })
            .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, |reply| Request::AppendEntries { args, reply })
            .await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.call(target, |reply| Request::InstallSnapshot { args, reply })
            .await
    }
}

/// Handle for processing a node's incoming requests in tests.
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against the given core.
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one request against a shared core. Receives first, then
    /// locks only for the handling itself.
    pub async fn process_one_shared(
        &mut self,
        node: &std::sync::Arc<tokio::sync::Mutex<RaftCore>>,
    ) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    fn handle_request(request: Request, node: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => {
                let result = node.handle_request_vote(&args);
                let _ = reply.send(result);
            }
            Request::AppendEntries { args, reply } => {
                let output = node.handle_append_entries(&args);
                // Test harness stands in for the applier task.
                if node.commit_index > node.last_applied {
                    node.apply_committed_entries();
                }
                let _ = reply.send(output.result);
            }
            Request::InstallSnapshot { args, reply } => {
                let result = node.handle_install_snapshot(&args);
                let _ = reply.send(result);
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes.
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster with an optional RPC
/// timeout.
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::RecordingStateMachine;
    use crate::storage::memory::MemoryStorage;

    fn new_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(RecordingStateMachine::new()),
        )
    }

    #[tokio::test]
    async fn test_request_vote_round_trip() {
        let (transports, mut handles) = create_cluster(&[1, 2, 3]);
        let mut node2 = new_core(2, vec![1, 3]);

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(
            transport1.request_vote(2, args),
            handle2.process_one(&mut node2)
        );

        let result = result.unwrap();
        assert!(result.vote_granted);
        assert_eq!(node2.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_append_entries_round_trip() {
        let (transports, mut handles) = create_cluster(&[1, 2]);
        let mut node2 = new_core(2, vec![1]);

        let transport1 = transports.get(&1).unwrap();
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(
            transport1.append_entries(2, args),
            handle2.process_one(&mut node2)
        );

        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.term, 1);
    }

    #[tokio::test]
    async fn test_node_not_found() {
        let (transports, _handles) = create_cluster(&[1, 2]);
        let transport1 = transports.get(&1).unwrap();

        let result = transport1
            .request_vote(
                99,
                RequestVoteArgs {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_request_times_out() {
        let timeout = Duration::from_millis(100);
        let (transports, _handles) = create_cluster_with_timeout(&[1, 2], Some(timeout));

        let transport1 = transports.get(&1).unwrap();
        let result = transport1
            .append_entries(
                2,
                AppendEntriesArgs {
                    term: 1,
                    leader_id: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await;

        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_responses_and_timeouts() {
        let timeout = Duration::from_millis(100);
        let (transports, mut handles) = create_cluster_with_timeout(&[1, 2, 3], Some(timeout));

        let mut node2 = new_core(2, vec![1, 3]);
        // Node 3 never responds.

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let mut handle2 = handles.remove(&2).unwrap();
        let (result2, result3, _) = tokio::join!(
            transport1.request_vote(2, args.clone()),
            transport1.request_vote(3, args),
            handle2.process_one(&mut node2),
        );

        assert!(result2.unwrap().vote_granted);
        assert!(matches!(result3, Err(TransportError::Timeout)));
    }
}
