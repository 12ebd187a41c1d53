//! Async node: fans consensus RPCs out over a `Transport`.
//!
//! Owns the shared core and the applier wake-up handle; all outbound
//! traffic (vote rounds, heartbeat/replication rounds, snapshot transfer,
//! leadership confirmation) goes through here.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};

use super::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, NodeRole,
    RaftCore, RequestVoteArgs,
};
use super::unix_millis;
use crate::metrics::SharedMetrics;
use crate::transport::{Transport, TransportError};

/// Shared reference to the consensus core.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level node driving outbound consensus traffic.
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
    apply_notify: Arc<Notify>,
    max_batch_entries: usize,
    metrics: SharedMetrics,
}

/// One outbound request in a heartbeat round.
enum PeerRequest {
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// The matching response.
enum PeerResponse {
    AppendEntries(Result<AppendEntriesResult, TransportError>),
    InstallSnapshot(Result<InstallSnapshotResult, TransportError>, u64),
}

impl<T: Transport> RaftNode<T> {
    pub fn new(
        core: RaftCore,
        transport: T,
        apply_notify: Arc<Notify>,
        max_batch_entries: usize,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
            apply_notify,
            max_batch_entries,
            metrics,
        }
    }

    /// Shared core handle for inbound RPC routing.
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    pub async fn role(&self) -> NodeRole {
        self.core.lock().await.role
    }

    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }

    /// Transition to Candidate for a fresh term.
    pub async fn start_election(&self) {
        let mut core = self.core.lock().await;
        core.start_election();
    }

    /// Request votes from all peers concurrently, counting responses as
    /// they land. Returns true on promotion to Leader; remaining responses
    /// are abandoned once the majority is in.
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if core.handle_request_vote_result(peer_id, &result) {
                    return true;
                }
                // A higher term in any response ends the candidacy.
                if core.role != NodeRole::Candidate {
                    return false;
                }
            }
        }

        false
    }

    /// Run one heartbeat round: for every peer, ship the entries it is
    /// missing (capped per batch), or a snapshot when its next index has
    /// been compacted away. This is the sole replication mechanism; an
    /// empty batch is a pure heartbeat.
    ///
    /// Returns (still_leader, peers_responding_ok).
    pub async fn send_heartbeat(&self) -> (bool, usize) {
        let requests = {
            let core = self.core.lock().await;
            if core.role != NodeRole::Leader {
                return (false, 0);
            }
            self.build_peer_requests(&core)
        };

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, request)| {
                let transport = &self.transport;
                async move {
                    match request {
                        PeerRequest::AppendEntries(args) => {
                            let result = transport.append_entries(peer_id, args).await;
                            (peer_id, PeerResponse::AppendEntries(result))
                        }
                        PeerRequest::InstallSnapshot(args) => {
                            let last_included = args.last_included_index;
                            let result = transport.install_snapshot(peer_id, args).await;
                            (peer_id, PeerResponse::InstallSnapshot(result, last_included))
                        }
                    }
                }
            })
            .collect();

        // Wait for every peer so higher terms are observed and slow
        // followers still get their entries this round.
        let mut success_count = 0;
        while let Some((peer_id, response)) = futures.next().await {
            match response {
                PeerResponse::AppendEntries(Ok(result)) => {
                    let mut core = self.core.lock().await;
                    if let Some(committed) = core.handle_append_entries_result(peer_id, &result) {
                        self.record_commit(&core, committed);
                        self.apply_notify.notify_one();
                    }
                    if result.success {
                        success_count += 1;
                    }
                }
                PeerResponse::InstallSnapshot(Ok(result), last_included) => {
                    let mut core = self.core.lock().await;
                    match result {
                        InstallSnapshotResult::Success { term } => {
                            core.observe_term(term);
                            if core.role == NodeRole::Leader {
                                core.next_index.insert(peer_id, last_included + 1);
                                core.match_index.insert(peer_id, last_included);
                                success_count += 1;
                            }
                        }
                        InstallSnapshotResult::Failed { term, .. } => {
                            core.observe_term(term);
                        }
                    }
                }
                // Transient peer failure: no state change, retried on the
                // next tick.
                PeerResponse::AppendEntries(Err(_)) | PeerResponse::InstallSnapshot(Err(_), _) => {}
            }
        }

        let still_leader = self.core.lock().await.role == NodeRole::Leader;
        (still_leader, success_count)
    }

    /// Confirm leadership with a round of empty heartbeats, returning as
    /// soon as a majority of the cluster has answered. Serves the
    /// read-path leadership check.
    pub async fn confirm_leadership(&self) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if core.role != NodeRole::Leader {
                return false;
            }
            let mut requests = Vec::new();
            for &peer_id in &core.peers {
                // A follower can report a match beyond our last entry (its
                // own uncommitted tail); never probe past what we hold.
                let next_idx = core
                    .next_index
                    .get(&peer_id)
                    .copied()
                    .unwrap_or(1)
                    .min(core.last_log_index() + 1);
                let prev_log_index = next_idx.saturating_sub(1);
                let prev_log_term = core.term_at(prev_log_index).unwrap_or(0);
                requests.push((
                    peer_id,
                    AppendEntriesArgs {
                        term: core.current_term,
                        leader_id: core.id,
                        prev_log_index,
                        prev_log_term,
                        entries: vec![],
                        leader_commit: core.commit_index,
                    },
                ));
            }
            requests
        };

        // Majority counting includes this node's own vote for itself.
        let cluster_size = requests.len() + 1;
        let majority = cluster_size / 2 + 1;
        let mut acks = 1;

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args)| {
                let transport = &self.transport;
                async move { (peer_id, transport.append_entries(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if let Some(committed) = core.handle_append_entries_result(peer_id, &result) {
                    self.record_commit(&core, committed);
                    self.apply_notify.notify_one();
                }
                if core.role != NodeRole::Leader {
                    return false;
                }
                if result.success {
                    acks += 1;
                }
            }
            if acks >= majority {
                return self.core.lock().await.role == NodeRole::Leader;
            }
        }

        false
    }

    /// Record a commit with its time-since-append latency. The committed
    /// entry is still in the log here: compaction runs in the applier,
    /// which has not been woken for this index yet. An entry surviving a
    /// failover carries the previous leader's clock in `created_at`, so
    /// saturate rather than underflow.
    fn record_commit(&self, core: &RaftCore, committed: u64) {
        let latency_ms = core
            .get_log_entry(committed)
            .map(|e| unix_millis().saturating_sub(e.created_at))
            .unwrap_or(0);
        self.metrics.record_commit(committed, core.current_term, latency_ms);
    }

    /// Build the per-peer request set for one heartbeat round. Must be
    /// called with the core lock held.
    fn build_peer_requests(&self, core: &RaftCore) -> Vec<(u64, PeerRequest)> {
        let mut requests = Vec::new();
        for &peer_id in &core.peers {
            // Clamp: a follower's reply can push next_index past our last
            // entry, and a probe beyond the log has no defined prev term.
            let next_idx = core
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(1)
                .min(core.last_log_index() + 1);

            // A peer whose next entry was compacted away needs the
            // snapshot first.
            if next_idx <= core.snapshot_last_index {
                if let Ok(Some(snapshot)) = core.load_snapshot() {
                    requests.push((
                        peer_id,
                        PeerRequest::InstallSnapshot(InstallSnapshotArgs {
                            term: core.current_term,
                            leader_id: core.id,
                            last_included_index: snapshot.metadata.last_included_index,
                            last_included_term: snapshot.metadata.last_included_term,
                            offset: 0,
                            data: snapshot.data,
                            done: true,
                        }),
                    ));
                }
                // Snapshot unreadable: skip this peer for now.
                continue;
            }

            let prev_log_index = next_idx.saturating_sub(1);
            let prev_log_term = core.term_at(prev_log_index).unwrap_or(0);

            let entries: Vec<_> = core
                .log
                .iter()
                .filter(|e| e.index >= next_idx)
                .take(self.max_batch_entries)
                .cloned()
                .collect();

            requests.push((
                peer_id,
                PeerRequest::AppendEntries(AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: core.commit_index,
                }),
            ));
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::Command;
    use crate::state_machine::vault::KeyVault;
    use crate::state_machine::RecordingStateMachine;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::{create_cluster, create_cluster_with_timeout, InMemoryTransport};
    use std::time::Duration;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(RecordingStateMachine::new()),
        )
    }

    fn new_vault_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(KeyVault::new()),
        )
    }

    fn new_node(core: RaftCore, transport: InMemoryTransport) -> RaftNode<InMemoryTransport> {
        let metrics = Arc::new(crate::metrics::MetricsCollector::new(0));
        RaftNode::new(core, transport, Arc::new(Notify::new()), 500, metrics)
    }

    fn put(key: &str, value: &str) -> Command {
        Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_election_wins_with_majority() {
        let (mut transports, mut handles) = create_cluster(&[1, 2, 3]);

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let shared3 = Arc::new(Mutex::new(new_test_core(3, vec![1, 2])));

        node1.start_election().await;

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        let (became_leader, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
            handle3.process_one_shared(&shared3),
        );

        assert!(became_leader);
        assert_eq!(node1.role().await, NodeRole::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_wins_with_one_peer_down() {
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&[1, 2, 3], Some(timeout));

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        // Node 3 never answers.

        node1.start_election().await;

        let mut handle2 = handles.remove(&2).unwrap();
        let (became_leader, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
        );

        assert!(became_leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_fails_without_majority() {
        let timeout = Duration::from_millis(100);
        let (mut transports, _handles) = create_cluster_with_timeout(&[1, 2, 3], Some(timeout));

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        node1.start_election().await;

        let became_leader = node1.request_votes().await;

        assert!(!became_leader);
        assert_eq!(node1.role().await, NodeRole::Candidate);
    }

    #[tokio::test]
    async fn test_heartbeat_replicates_and_commits() {
        let (mut transports, mut handles) = create_cluster(&[1, 2, 3]);

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared1 = node1.shared_core();
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let shared3 = Arc::new(Mutex::new(new_test_core(3, vec![1, 2])));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
            handle3.process_one_shared(&shared3),
        );
        assert_eq!(node1.role().await, NodeRole::Leader);

        // Queue two commands behind the NoOp.
        {
            let mut core = shared1.lock().await;
            core.append_command(put("x", "1")).unwrap();
            core.append_command(put("y", "2")).unwrap();
        }

        // One round ships NoOp plus both commands and commits them.
        let (_, _, _) = tokio::join!(
            node1.send_heartbeat(),
            handle2.process_one_shared(&shared2),
            handle3.process_one_shared(&shared3),
        );

        assert_eq!(node1.commit_index().await, 3);
        assert_eq!(shared2.lock().await.log.len(), 3);
        assert_eq!(shared3.lock().await.log.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_commits_with_one_peer_down() {
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&[1, 2, 3], Some(timeout));

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared1 = node1.shared_core();
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));

        let mut handle2 = handles.remove(&2).unwrap();

        node1.start_election().await;
        let (_, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
        );
        assert_eq!(node1.role().await, NodeRole::Leader);

        shared1.lock().await.append_command(put("x", "1")).unwrap();

        let ((still_leader, _), _) = tokio::join!(
            node1.send_heartbeat(),
            handle2.process_one_shared(&shared2),
        );

        // Leader + node 2 form the majority; node 3's silence is harmless.
        assert!(still_leader);
        assert_eq!(node1.commit_index().await, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_repairs_diverged_follower() {
        let (mut transports, mut handles) = create_cluster(&[1, 2]);

        let mut leader = new_test_core(1, vec![2]);
        leader.start_election();
        leader.become_leader();
        leader.append_command(put("a", "1")).unwrap();
        leader.append_command(put("b", "2")).unwrap();

        // Follower holds a stale tail: same prefix, wrong entry at 3.
        let mut follower = new_test_core(2, vec![1]);
        follower.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                crate::core::raft_core::LogEntry {
                    term: 1,
                    index: 1,
                    command: Command::NoOp,
                    created_at: 0,
                    applied: false,
                },
                crate::core::raft_core::LogEntry {
                    term: 1,
                    index: 2,
                    command: put("a", "1"),
                    created_at: 0,
                    applied: false,
                },
            ],
            leader_commit: 0,
        });
        follower.log.push(crate::core::raft_core::LogEntry {
            term: 0,
            index: 3,
            command: put("stale", "x"),
            created_at: 0,
            applied: false,
        });

        // Leader believes the follower is fully caught up, so the first
        // round probes at the diverged tail and gets a conflict hint back.
        leader.next_index.insert(2, 4);

        let node1 = new_node(leader, transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(follower));
        let mut handle2 = handles.remove(&2).unwrap();

        // Repair may take a few rounds: reject with hint, then resend.
        for _ in 0..3 {
            let (_, _) = tokio::join!(
                node1.send_heartbeat(),
                handle2.process_one_shared(&shared2),
            );
        }

        let follower = shared2.lock().await;
        let leader = node1.core.lock().await;
        assert_eq!(follower.log.len(), leader.log.len());
        for (f, l) in follower.log.iter().zip(leader.log.iter()) {
            assert_eq!((f.index, f.term), (l.index, l.term));
        }
    }

    #[tokio::test]
    async fn test_heartbeat_sends_snapshot_to_lagging_follower() {
        let (mut transports, mut handles) = create_cluster(&[1, 2]);

        let mut leader = new_vault_core(1, vec![2]);
        leader.start_election();
        leader.become_leader();
        leader.append_command(put("x", "1")).unwrap();
        leader.append_command(put("y", "2")).unwrap();
        leader.commit_index = 3;
        leader.apply_committed_entries();
        leader.take_snapshot().unwrap();
        assert!(leader.log.is_empty());

        let node1 = new_node(leader, transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_vault_core(2, vec![1])));
        let mut handle2 = handles.remove(&2).unwrap();

        // next_index for node 2 is 1, inside the compacted range.
        let (_, _) = tokio::join!(
            node1.send_heartbeat(),
            handle2.process_one_shared(&shared2),
        );

        let follower = shared2.lock().await;
        assert_eq!(follower.snapshot_last_index, 3);
        assert_eq!(follower.last_applied, 3);

        // Leader bookkeeping moved past the snapshot.
        let leader = node1.core.lock().await;
        assert_eq!(leader.next_index.get(&2), Some(&4));
        assert_eq!(leader.match_index.get(&2), Some(&3));
    }

    #[tokio::test]
    async fn test_replication_resumes_after_snapshot_boundary() {
        let (mut transports, mut handles) = create_cluster(&[1, 2]);

        let mut leader = new_vault_core(1, vec![2]);
        leader.start_election();
        leader.become_leader();
        leader.append_command(put("x", "1")).unwrap();
        leader.commit_index = 2;
        leader.apply_committed_entries();
        leader.take_snapshot().unwrap();
        // One more entry past the snapshot.
        leader.append_command(put("z", "3")).unwrap();

        let node1 = new_node(leader, transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_vault_core(2, vec![1])));
        let mut handle2 = handles.remove(&2).unwrap();

        // First round installs the snapshot, second ships the tail with
        // prev at the snapshot boundary.
        for _ in 0..2 {
            let (_, _) = tokio::join!(
                node1.send_heartbeat(),
                handle2.process_one_shared(&shared2),
            );
        }

        let follower = shared2.lock().await;
        assert_eq!(follower.snapshot_last_index, 2);
        assert_eq!(follower.log.len(), 1);
        assert_eq!(follower.log[0].index, 3);
    }

    #[tokio::test]
    async fn test_confirm_leadership_with_majority() {
        let (mut transports, mut handles) = create_cluster(&[1, 2, 3]);

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let shared3 = Arc::new(Mutex::new(new_test_core(3, vec![1, 2])));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
            handle3.process_one_shared(&shared3),
        );

        let (confirmed, _) = tokio::join!(
            node1.confirm_leadership(),
            handle2.process_one_shared(&shared2),
        );
        assert!(confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_leadership_fails_isolated() {
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&[1, 2, 3], Some(timeout));

        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let mut handle2 = handles.remove(&2).unwrap();

        node1.start_election().await;
        let (_, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one_shared(&shared2),
        );
        assert_eq!(node1.role().await, NodeRole::Leader);

        // Now both peers are silent: no majority, no confirmation.
        let confirmed = node1.confirm_leadership().await;
        assert!(!confirmed);
    }

    #[tokio::test]
    async fn test_confirm_leadership_rejected_on_follower() {
        let (mut transports, _handles) = create_cluster(&[1, 2, 3]);
        let node1 = new_node(new_test_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        assert!(!node1.confirm_leadership().await);
    }
}
