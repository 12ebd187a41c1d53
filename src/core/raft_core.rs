//! Consensus state machine (sync, transport-agnostic).
//!
//! Implements the leader-election and log-replication rules from
//! "In Search of an Understandable Consensus Algorithm" (Ongaro &
//! Ousterhout), specialized to the key vault's typed commands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::command::Command;
use crate::core::snapshot::{Snapshot, SnapshotMetadata};
use crate::core::unix_millis;
use crate::state_machine::{ApplyResult, Snapshotable};
use crate::storage::{Storage, StorageError};

/// Node roles in the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Passive: receives updates from the leader.
    Follower,
    /// Actively seeking votes to become leader.
    Candidate,
    /// Handles all client requests and replicates the log.
    Leader,
}

/// A single log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader.
    pub term: u64,
    /// Position in the log (1-indexed, dense).
    pub index: u64,
    /// Command to apply to the state machine.
    pub command: Command,
    /// When the entry was accepted into the leader's log, unix millis.
    pub created_at: u64,
    /// Whether this node has applied the entry. Node-local runtime state:
    /// never serialized, reset to false whenever an entry arrives over the
    /// wire or is reloaded from disk.
    #[serde(skip)]
    pub applied: bool,
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// RequestVote RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Receiver's current term, for the candidate to update itself.
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` is a pure heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: u64,
}

/// AppendEntries RPC result with replication-tracking fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Receiver's current term, for the leader to update itself.
    pub term: u64,
    /// True if the receiver held an entry matching `prev_log_index` /
    /// `prev_log_term` and accepted the entries.
    pub success: bool,
    /// Highest index the receiver now holds (on success).
    pub match_index: u64,
    /// Receiver's last log index.
    pub last_log_index: u64,
    /// Term of the receiver's last entry.
    pub last_log_term: u64,
    /// On rejection: earliest index the leader may retry from (the
    /// divergence point, or the receiver's last index + 1 when it is
    /// simply behind). Zero on success.
    pub conflict_index: u64,
}

/// Result of handling an AppendEntries RPC locally.
#[derive(Debug, Clone)]
pub struct HandleAppendEntriesOutput {
    /// The response to send back to the leader.
    pub result: AppendEntriesResult,
    /// Leader id if a valid leader was recognized.
    pub leader_id: Option<u64>,
}

/// InstallSnapshot RPC arguments. Chunks accumulate on the receiver; only
/// the final chunk (`done = true`) triggers installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// InstallSnapshot RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// Chunk accepted (and installed, when it was the final one).
    Success { term: u64 },
    /// Snapshot rejected or installation failed.
    Failed { term: u64, reason: String },
}

/// Outcome of applying one committed entry. Carries the entry's term and
/// creation time so callers can record apply events without re-reading a
/// log that may already be compacted.
#[derive(Debug, Clone)]
pub struct AppliedEntry {
    pub index: u64,
    pub term: u64,
    /// When the entry was accepted into the leader's log, unix millis.
    pub created_at: u64,
    pub result: ApplyResult,
}

/// Core consensus state machine. All mutation happens under the node-wide
/// mutex owned by the coordinator; this type itself is synchronous.
pub struct RaftCore {
    // Storage backend for persistent state.
    storage: Box<dyn Storage>,
    // State machine committed entries are applied to.
    state_machine: Box<dyn Snapshotable>,

    // Persistent state (cached in memory, always written through storage
    // before the corresponding RPC response goes out).
    /// Latest term this node has seen. Never decreases.
    pub current_term: u64,
    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<u64>,
    /// Log entries; on a compacted log the first held index is
    /// `snapshot_last_index + 1`.
    pub log: Vec<LogEntry>,
    /// Last log index covered by the snapshot (0 if none).
    pub snapshot_last_index: u64,
    /// Term of the last entry covered by the snapshot (0 if none).
    pub snapshot_last_term: u64,

    // Volatile state.
    /// Highest index known committed. Never decreases.
    pub commit_index: u64,
    /// Highest index applied to the state machine. Never decreases.
    pub last_applied: u64,

    // Leader-only replication bookkeeping; reinitialized on every
    // promotion, never persisted.
    /// Per peer: next log index to send.
    pub next_index: HashMap<u64, u64>,
    /// Per peer: highest index known replicated.
    pub match_index: HashMap<u64, u64>,

    // Node identity and runtime state.
    pub id: u64,
    pub role: NodeRole,
    /// Ids of the other nodes in the cluster.
    pub peers: Vec<u64>,
    /// Peers that granted votes in the current election.
    votes_received: Vec<u64>,
    /// Last known leader, for client redirect hints.
    pub current_leader: Option<u64>,
    /// Last valid leader contact, drives the election timer.
    pub last_heartbeat: Instant,
    /// Applied entries past the snapshot before an automatic snapshot
    /// (0 disables).
    snapshot_threshold: u64,
    /// Accumulates InstallSnapshot chunks until the final one arrives.
    incoming_snapshot: Vec<u8>,
}

impl RaftCore {
    /// Create a node, recovering persistent state from storage.
    ///
    /// Loads `(current_term, voted_for)` and the log, restores the state
    /// machine from the latest readable snapshot, and enters Follower. A
    /// corrupt snapshot store is not fatal: the node starts empty and
    /// catches up via replication.
    pub fn new(
        id: u64,
        peers: Vec<u64>,
        storage: Box<dyn Storage>,
        mut state_machine: Box<dyn Snapshotable>,
    ) -> Self {
        let current_term = storage.load_term().expect("failed to load term from storage");
        let voted_for = storage
            .load_voted_for()
            .expect("failed to load voted_for from storage");
        let mut log = storage.load_log().expect("failed to load log from storage");

        let (snapshot_last_index, snapshot_last_term) = match storage.load_snapshot() {
            Ok(Some(snapshot)) => {
                state_machine
                    .restore(&snapshot.data)
                    .expect("failed to restore state machine from snapshot");
                (
                    snapshot.metadata.last_included_index,
                    snapshot.metadata.last_included_term,
                )
            }
            Ok(None) => (0, 0),
            Err(e) => {
                warn!(
                    "node {}: snapshot store unusable ({}), starting empty",
                    id, e
                );
                (0, 0)
            }
        };

        // Entries at or below the snapshot are already captured by it.
        log.retain(|e| e.index > snapshot_last_index);

        // Everything in the snapshot is committed and applied.
        let commit_index = snapshot_last_index;
        let last_applied = snapshot_last_index;

        RaftCore {
            storage,
            state_machine,
            current_term,
            voted_for,
            log,
            snapshot_last_index,
            snapshot_last_term,
            commit_index,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            role: NodeRole::Follower,
            peers,
            votes_received: Vec::new(),
            current_leader: None,
            last_heartbeat: Instant::now(),
            snapshot_threshold: 10_000,
            incoming_snapshot: Vec::new(),
        }
    }

    /// Set the automatic snapshot threshold (0 disables).
    pub fn set_snapshot_threshold(&mut self, threshold: u64) {
        self.snapshot_threshold = threshold;
    }

    /// Strict majority of the configured cluster size (self included).
    pub fn majority(&self) -> usize {
        (1 + self.peers.len()) / 2 + 1
    }

    // === Persistence helpers ===
    // Durable-write failure here is fatal: the node must not respond as if
    // it had persisted, so these crash fast.

    fn set_term(&mut self, term: u64) {
        self.current_term = term;
        self.storage.save_term(term).expect("failed to persist term");
    }

    fn set_voted_for(&mut self, voted_for: Option<u64>) {
        self.voted_for = voted_for;
        self.storage
            .save_voted_for(voted_for)
            .expect("failed to persist voted_for");
    }

    /// Adopt a higher term and become Follower with a cleared vote.
    fn step_down(&mut self, term: u64) {
        let old_role = self.role;
        self.set_term(term);
        self.set_voted_for(None);
        self.role = NodeRole::Follower;
        if old_role != NodeRole::Follower {
            info!(
                "node {}: stepped down to follower (was {:?}, saw term {})",
                self.id, old_role, term
            );
            self.current_leader = None;
        }
    }

    /// Adopt a higher term observed in any RPC request or response.
    pub fn observe_term(&mut self, term: u64) {
        if term > self.current_term {
            self.step_down(term);
        }
    }

    fn persist_log_entry(&mut self, entry: LogEntry) {
        self.storage
            .append_log_entries(&[entry.clone()])
            .expect("failed to persist log entry");
        self.log.push(entry);
    }

    fn persist_truncate_log(&mut self, from_index: u64) {
        self.storage
            .truncate_log(from_index)
            .expect("failed to truncate log");
        self.log.retain(|e| e.index < from_index);
    }

    // === Log accessors ===

    /// Last log index; falls back to the snapshot boundary on an empty log.
    pub fn last_log_index(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.index,
            None => self.snapshot_last_index,
        }
    }

    /// Term of the last log entry; falls back to the snapshot boundary.
    pub fn last_log_term(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.term,
            None => self.snapshot_last_term,
        }
    }

    /// Get a log entry by index, accounting for the snapshot offset.
    /// Returns None for entries covered by the snapshot or beyond the log.
    pub fn get_log_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            None
        } else {
            // log[0] holds the entry at index snapshot_last_index + 1.
            let offset = (index - self.snapshot_last_index - 1) as usize;
            self.log.get(offset)
        }
    }

    /// Term of the entry at `index`, treating index 0 and the snapshot
    /// boundary as known. None for compacted interior entries or indices
    /// beyond the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_last_index {
            Some(self.snapshot_last_term)
        } else {
            self.get_log_entry(index).map(|e| e.term)
        }
    }

    /// A candidate's log is at least as up-to-date as ours when its last
    /// term is higher, or terms are equal and its last index is >= ours.
    pub fn is_log_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_term > my_last_term
            || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
    }

    // === RequestVote ===

    /// Handle a RequestVote RPC.
    pub fn handle_request_vote(&mut self, req: &RequestVoteArgs) -> RequestVoteResult {
        if req.term < self.current_term {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        self.observe_term(req.term);

        // One vote per term.
        if self.voted_for.is_some() && self.voted_for != Some(req.candidate_id) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if !self.is_log_up_to_date(req.last_log_term, req.last_log_index) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        self.set_voted_for(Some(req.candidate_id));
        // Granting a vote counts as valid election activity.
        self.last_heartbeat = Instant::now();

        RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        }
    }

    /// Adopt any higher term carried in a vote response.
    pub fn process_request_vote_response(&mut self, result: &RequestVoteResult) {
        self.observe_term(result.term);
    }

    /// Handle a vote response as a candidate: track the vote and become
    /// leader on reaching a strict majority. Returns true on promotion.
    pub fn handle_request_vote_result(&mut self, peer_id: u64, result: &RequestVoteResult) -> bool {
        self.process_request_vote_response(result);

        // Responses for a prior term or after a transition are stale.
        if self.role != NodeRole::Candidate {
            return false;
        }

        if result.vote_granted && !self.votes_received.contains(&peer_id) {
            self.votes_received.push(peer_id);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
            return true;
        }

        false
    }

    // === AppendEntries ===

    /// Handle an AppendEntries RPC (heartbeat or replication).
    ///
    /// Advances `commit_index` from `leader_commit` but never applies
    /// inline; the caller signals the applier when commit moves.
    pub fn handle_append_entries(&mut self, req: &AppendEntriesArgs) -> HandleAppendEntriesOutput {
        self.observe_term(req.term);

        if req.term < self.current_term {
            // Stale leader: reject without resetting the election timer.
            return HandleAppendEntriesOutput {
                result: self.append_entries_response(false, 0),
                leader_id: None,
            };
        }

        // Valid leader contact: a candidate in the same term yields.
        self.role = NodeRole::Follower;
        self.current_leader = Some(req.leader_id);
        self.last_heartbeat = Instant::now();

        // Consistency check on the entry preceding the batch.
        let prev_ok = match self.term_at(req.prev_log_index) {
            Some(term) => term == req.prev_log_term,
            // Compacted interior entries are covered by the snapshot and
            // therefore known to match; anything else is missing.
            None => req.prev_log_index <= self.snapshot_last_index,
        };

        if !prev_ok {
            let conflict_index = self.conflict_hint(req.prev_log_index);
            debug!(
                "node {}: rejecting entries from leader {} (prev {}:{} mismatch, conflict hint {})",
                self.id, req.leader_id, req.prev_log_index, req.prev_log_term, conflict_index
            );
            return HandleAppendEntriesOutput {
                result: self.append_entries_response(false, conflict_index),
                leader_id: Some(req.leader_id),
            };
        }

        self.resolve_entries(&req.entries);

        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_log_index());
        }

        HandleAppendEntriesOutput {
            result: self.append_entries_response(true, 0),
            leader_id: Some(req.leader_id),
        }
    }

    fn append_entries_response(&self, success: bool, conflict_index: u64) -> AppendEntriesResult {
        AppendEntriesResult {
            term: self.current_term,
            success,
            match_index: if success { self.last_log_index() } else { 0 },
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
            conflict_index,
        }
    }

    /// Earliest index the leader may retry from after a rejection: the
    /// start of the conflicting term's run, or our last index + 1 when we
    /// are simply behind.
    fn conflict_hint(&self, prev_log_index: u64) -> u64 {
        let last = self.last_log_index();
        if prev_log_index > last {
            return last + 1;
        }
        let conflicting_term = match self.term_at(prev_log_index) {
            Some(term) => term,
            None => return self.snapshot_last_index + 1,
        };
        let mut index = prev_log_index;
        while index > self.snapshot_last_index + 1 && self.term_at(index - 1) == Some(conflicting_term)
        {
            index -= 1;
        }
        index
    }

    /// Merge incoming entries into the log. An existing entry with the
    /// same index and term is kept untouched (stale retries must be
    /// idempotent); a term conflict truncates the log from that index
    /// before the incoming suffix is appended.
    fn resolve_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }

            let existing_term = self.get_log_entry(entry.index).map(|e| e.term);
            match existing_term {
                Some(term) if term == entry.term => {
                    // Same (index, term): the entry and all its
                    // predecessors already match.
                }
                Some(_) => {
                    self.persist_truncate_log(entry.index);
                    self.append_replicated(entry);
                }
                None => {
                    self.append_replicated(entry);
                }
            }
        }
    }

    fn append_replicated(&mut self, entry: &LogEntry) {
        let mut entry = entry.clone();
        entry.applied = false;
        debug!(
            "node {}: replicated entry {} (term {}): {}",
            self.id, entry.index, entry.term, entry.command
        );
        self.persist_log_entry(entry);
    }

    /// Handle an AppendEntries response as leader. Updates per-peer
    /// bookkeeping and recomputes the commit index; returns the new commit
    /// index when it advanced so the caller can wake the applier.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        result: &AppendEntriesResult,
    ) -> Option<u64> {
        self.observe_term(result.term);

        if self.role != NodeRole::Leader {
            return None;
        }

        if result.success {
            let current_match = self.match_index.get(&peer_id).copied().unwrap_or(0);
            // A reply for an older batch can arrive late; match_index only
            // moves forward.
            if result.match_index > current_match {
                self.match_index.insert(peer_id, result.match_index);
            }
            let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            if result.match_index + 1 > current_next {
                self.next_index.insert(peer_id, result.match_index + 1);
            }
            self.advance_commit_index()
        } else {
            // Back off: prefer the follower's conflict hint, fall back to
            // a single decrement, never below 1.
            let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            let fallback = current_next.saturating_sub(1).max(1);
            let retry = if result.conflict_index > 0 {
                result.conflict_index.min(fallback)
            } else {
                fallback
            };
            self.next_index.insert(peer_id, retry);
            debug!(
                "node {}: replication to {} rejected, retrying from index {}",
                self.id, peer_id, retry
            );
            None
        }
    }

    /// Find the largest N > commit_index replicated on a strict majority
    /// with `log[N].term == current_term`, and commit it. Entries from
    /// prior terms are only committed indirectly through such an N.
    fn advance_commit_index(&mut self) -> Option<u64> {
        let mut index = self.last_log_index();
        while index > self.commit_index {
            if self.term_at(index) == Some(self.current_term) {
                let replicated = 1 + self
                    .match_index
                    .values()
                    .filter(|&&m| m >= index)
                    .count();
                if replicated >= self.majority() {
                    info!(
                        "node {}: committed through index {} ({}/{} replicas)",
                        self.id,
                        index,
                        replicated,
                        1 + self.peers.len()
                    );
                    self.commit_index = index;
                    return Some(index);
                }
            }
            index -= 1;
        }
        None
    }

    // === Elections and role transitions ===

    /// Become Candidate: bump the term, vote for self, reset the timer.
    pub fn start_election(&mut self) {
        self.set_term(self.current_term + 1);
        self.role = NodeRole::Candidate;
        info!("node {}: became candidate for term {}", self.id, self.current_term);

        self.current_leader = None;
        self.set_voted_for(Some(self.id));

        self.votes_received.clear();
        self.votes_received.push(self.id);

        self.last_heartbeat = Instant::now();
    }

    /// Become Leader: reinitialize replication bookkeeping and append a
    /// NoOp at the new term so earlier-term entries can be committed.
    pub fn become_leader(&mut self) {
        self.role = NodeRole::Leader;
        self.current_leader = Some(self.id);
        self.last_heartbeat = Instant::now();
        info!("node {}: became leader for term {}", self.id, self.current_term);

        let last_index = self.last_log_index();
        for peer_id in &self.peers {
            self.next_index.insert(*peer_id, last_index + 1);
            self.match_index.insert(*peer_id, 0);
        }

        let noop = LogEntry {
            term: self.current_term,
            index: last_index + 1,
            command: Command::NoOp,
            created_at: unix_millis(),
            applied: false,
        };
        self.persist_log_entry(noop);
    }

    /// Append a client command to the log. Returns None on a non-leader.
    pub fn append_command(&mut self, command: Command) -> Option<LogEntry> {
        if self.role != NodeRole::Leader {
            return None;
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
            created_at: unix_millis(),
            applied: false,
        };
        debug!(
            "node {}: appended entry {} (term {}): {}",
            self.id, entry.index, entry.term, entry.command
        );
        self.persist_log_entry(entry.clone());
        Some(entry)
    }

    // === Applier ===

    /// Advance `last_applied` toward `commit_index`, applying entries to
    /// the state machine in strict index order, each at most once. Invalid
    /// commands are logged and skipped but still marked applied so
    /// progress is preserved. Triggers an automatic snapshot when the
    /// threshold is exceeded.
    pub fn apply_committed_entries(&mut self) -> Vec<AppliedEntry> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;

            let offset = (self.last_applied - self.snapshot_last_index - 1) as usize;
            let (command, term, created_at, already_applied) = match self.log.get(offset) {
                Some(entry) => (
                    entry.command.clone(),
                    entry.term,
                    entry.created_at,
                    entry.applied,
                ),
                None => panic!(
                    "entry {} missing while applying (snapshot at {}, log length {})",
                    self.last_applied,
                    self.snapshot_last_index,
                    self.log.len()
                ),
            };

            if already_applied {
                continue;
            }

            if let Err(msg) = command.validate() {
                warn!(
                    "node {}: skipping invalid command at index {}: {}",
                    self.id, self.last_applied, msg
                );
                self.log[offset].applied = true;
                results.push(AppliedEntry {
                    index: self.last_applied,
                    term,
                    created_at,
                    result: Err(msg),
                });
                continue;
            }

            let result = self.state_machine.apply(&command);
            self.log[offset].applied = true;
            results.push(AppliedEntry {
                index: self.last_applied,
                term,
                created_at,
                result,
            });
        }

        // All roles snapshot independently to bound log growth; lagging
        // followers additionally receive snapshots over InstallSnapshot.
        if self.snapshot_threshold > 0 {
            let entries_since_snapshot = self.last_applied - self.snapshot_last_index;
            if entries_since_snapshot >= self.snapshot_threshold {
                info!(
                    "node {}: automatic snapshot ({} entries since last)",
                    self.id, entries_since_snapshot
                );
                if let Err(e) = self.take_snapshot() {
                    warn!("node {}: automatic snapshot failed: {}", self.id, e);
                }
            }
        }

        results
    }

    // === Snapshots ===

    /// Capture the state machine up to `last_applied`, persist the
    /// snapshot durably, and compact the log.
    pub fn take_snapshot(&mut self) -> Result<SnapshotMetadata, String> {
        if self.last_applied == 0 {
            return Err("no entries applied yet, nothing to snapshot".to_string());
        }
        if self.last_applied <= self.snapshot_last_index {
            return Err(format!(
                "snapshot already covers index {}, last applied is {}",
                self.snapshot_last_index, self.last_applied
            ));
        }

        let last_applied_term = self
            .term_at(self.last_applied)
            .ok_or_else(|| "cannot resolve term of last applied entry".to_string())?;

        let data = self.state_machine.snapshot()?;

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: self.last_applied,
                last_included_term: last_applied_term,
                created_term: self.current_term,
                created_at: unix_millis(),
            },
            data,
        };

        self.storage
            .save_snapshot(&snapshot)
            .map_err(|e| format!("failed to save snapshot: {}", e))?;

        self.snapshot_last_index = snapshot.metadata.last_included_index;
        self.snapshot_last_term = snapshot.metadata.last_included_term;

        let keep_from = self.snapshot_last_index + 1;
        self.storage
            .compact_log(keep_from)
            .map_err(|e| format!("failed to compact log: {}", e))?;
        self.log.retain(|e| e.index >= keep_from);

        info!(
            "node {}: snapshot taken at {}:{}",
            self.id, self.snapshot_last_index, self.snapshot_last_term
        );
        Ok(snapshot.metadata)
    }

    /// Load the current snapshot from storage.
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.storage.load_snapshot()
    }

    /// Handle an InstallSnapshot RPC. Chunks accumulate until `done`;
    /// installation replaces the state machine, discards covered log
    /// entries, and retains the tail only when the local entry at the
    /// snapshot boundary carries the matching term.
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> InstallSnapshotResult {
        if args.term < self.current_term {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            };
        }

        self.observe_term(args.term);
        self.role = NodeRole::Follower;
        self.current_leader = Some(args.leader_id);
        self.last_heartbeat = Instant::now();

        if args.offset == 0 {
            self.incoming_snapshot.clear();
        }
        self.incoming_snapshot.extend_from_slice(&args.data);

        if !args.done {
            return InstallSnapshotResult::Success {
                term: self.current_term,
            };
        }

        let data = std::mem::take(&mut self.incoming_snapshot);

        if args.last_included_index <= self.snapshot_last_index {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!(
                    "snapshot too old: {} <= {}",
                    args.last_included_index, self.snapshot_last_index
                ),
            };
        }

        // Whether the local tail past the boundary is safe to keep. Must
        // be decided before the boundary fields move.
        let keep_tail = self.term_at(args.last_included_index) == Some(args.last_included_term);

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: args.last_included_index,
                last_included_term: args.last_included_term,
                created_term: args.term,
                created_at: unix_millis(),
            },
            data,
        };

        // Persist first so disk and memory cannot diverge.
        if let Err(e) = self.storage.save_snapshot(&snapshot) {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!("failed to save snapshot: {}", e),
            };
        }

        self.state_machine
            .restore(&snapshot.data)
            .expect("failed to restore state machine from installed snapshot");

        self.snapshot_last_index = args.last_included_index;
        self.snapshot_last_term = args.last_included_term;

        if keep_tail {
            self.log.retain(|e| e.index > args.last_included_index);
        } else {
            self.log.clear();
        }
        let _ = self.storage.compact_log(args.last_included_index + 1);
        if !keep_tail {
            let _ = self.storage.truncate_log(args.last_included_index + 1);
        }

        self.commit_index = self.commit_index.max(args.last_included_index);
        self.last_applied = self.last_applied.max(args.last_included_index);

        info!(
            "node {}: installed snapshot at {}:{} from leader {}",
            self.id, args.last_included_index, args.last_included_term, args.leader_id
        );

        InstallSnapshotResult::Success {
            term: self.current_term,
        }
    }
}
