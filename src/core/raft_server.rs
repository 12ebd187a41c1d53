//! Consensus coordinator.
//!
//! One task owns the control loop: the election timer, the leader-only
//! heartbeat ticker, and the client command channel all converge here, so
//! every role transition happens in one place. A separate applier task,
//! woken whenever the commit index moves, pushes committed entries into
//! the state machine without stalling replication.

use std::pin::pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::warn;

use super::config::RaftConfig;
use super::raft_core::{NodeRole, RaftCore};
use super::raft_node::{RaftNode, SharedCore};
use super::snapshot::SnapshotMetadata;
use super::unix_millis;
use crate::core::command::Command as VaultCommand;
use crate::metrics::{MetricsCollector, SharedMetrics};
use crate::transport::Transport;

/// Errors surfaced to clients of the coordinator.
#[derive(Debug, Clone)]
pub enum RaftError {
    /// This node is not the leader; redirect using the hint if present.
    NotLeader { leader_hint: Option<u64> },
    /// Snapshot request could not be satisfied.
    Snapshot(String),
}

/// Receipt for a write accepted into the leader's log. The entry is
/// pending until its index reaches the commit index.
#[derive(Debug, Clone, Copy)]
pub struct WriteReceipt {
    pub log_index: u64,
    pub term: u64,
}

/// Requests sent into the coordinator loop.
enum Command {
    /// Append a client command to the leader's log. Replies with the
    /// receipt as soon as the entry is durable locally, then drives a
    /// replication round without waiting for the next tick.
    Submit {
        command: VaultCommand,
        reply: oneshot::Sender<Result<WriteReceipt, RaftError>>,
    },
    /// Confirm leadership with a majority heartbeat round (read path).
    ConfirmLeadership { reply: oneshot::Sender<bool> },
    /// Take a snapshot of the state machine right now.
    TakeSnapshot {
        reply: oneshot::Sender<Result<SnapshotMetadata, RaftError>>,
    },
}

/// Handle for interacting with a running coordinator.
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a write. Returns the log position once the entry is in the
    /// leader's log; commitment follows asynchronously.
    pub async fn submit(&self, command: VaultCommand) -> Result<WriteReceipt, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?;

        reply_rx
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?
    }

    /// Confirm this node still leads by completing a majority heartbeat
    /// round. Linearizable reads gate on this.
    pub async fn confirm_leadership(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::ConfirmLeadership { reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Trigger a snapshot of the current state machine.
    pub async fn take_snapshot(&self) -> Result<SnapshotMetadata, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::TakeSnapshot { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Snapshot("coordinator stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| RaftError::Snapshot("coordinator stopped".to_string()))?
    }

    /// Shut the coordinator down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The coordinator itself. Constructed, then consumed by `start`.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
    apply_notify: Arc<Notify>,
    metrics: SharedMetrics,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a coordinator with the default config.
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a coordinator with a custom config. Returns the server and
    /// the shared core for inbound RPC handling.
    pub fn with_config(core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let apply_notify = Arc::new(Notify::new());
        let metrics = Arc::new(MetricsCollector::new(core.id));
        let node = RaftNode::new(
            core,
            transport,
            apply_notify.clone(),
            config.max_batch_entries,
            metrics.clone(),
        );
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
            apply_notify,
            metrics,
        };
        (server, shared_core)
    }

    /// Applier wake-up handle; the inbound RPC router shares it so
    /// follower-side commit movement reaches the applier task.
    pub fn apply_notify(&self) -> Arc<Notify> {
        self.apply_notify.clone()
    }

    /// Metrics collector recording coordinator events.
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Start the coordinator and applier tasks; returns the client handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        // Applier: woken on commit-index movement, applies committed
        // entries in index order under the node mutex, and exits when the
        // coordinator closes the stop channel. Each applied entry is
        // recorded with its time-since-append latency, closing the
        // PENDING -> committed -> applied trace in the event stream.
        let applier_core = self.node.shared_core();
        let applier_notify = self.apply_notify.clone();
        let applier_metrics = self.metrics.clone();
        let (applier_stop_tx, mut applier_stop_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = applier_notify.notified() => {
                        let mut core = applier_core.lock().await;
                        if core.commit_index > core.last_applied {
                            for applied in core.apply_committed_entries() {
                                let latency_ms =
                                    unix_millis().saturating_sub(applied.created_at);
                                applier_metrics.record_state_apply(
                                    applied.index,
                                    applied.term,
                                    latency_ms,
                                );
                            }
                        }
                    }
                    _ = applier_stop_rx.recv() => break,
                }
            }
        });

        tokio::spawn(self.run(applier_stop_tx));

        handle
    }

    /// Main coordinator loop.
    async fn run(mut self, _applier_stop: mpsc::Sender<()>) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Delay missed ticks so a long replication round cannot queue a
        // burst of heartbeats that starves the election branch.
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // A fresh draw every iteration: after a split vote the next
            // round races with different timeouts.
            let election_timeout = self.config.random_election_timeout();
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = heartbeat_interval.tick() => {
                    if self.node.role().await == NodeRole::Leader {
                        // The leader's own timer must not expire under it.
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.send_heartbeat().await;
                    }
                }
                _ = election_sleep => {
                    if self.node.role().await != NodeRole::Leader
                        && self.election_timed_out(election_timeout).await
                    {
                        self.run_election().await;
                    }
                }
                else => break,
            }
        }
        // Dropping _applier_stop closes the channel and stops the applier.
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Submit { command, reply } => {
                let result = {
                    let shared_core = self.node.shared_core();
                    let mut core = shared_core.lock().await;
                    if core.role != NodeRole::Leader {
                        Err(RaftError::NotLeader {
                            leader_hint: core.current_leader,
                        })
                    } else {
                        match core.append_command(command) {
                            Some(entry) => Ok(WriteReceipt {
                                log_index: entry.index,
                                term: entry.term,
                            }),
                            None => Err(RaftError::NotLeader { leader_hint: None }),
                        }
                    }
                };
                let accepted = result.is_ok();
                let _ = reply.send(result);
                // Push the entry out now instead of waiting for the tick.
                if accepted {
                    self.node.send_heartbeat().await;
                }
            }
            Command::ConfirmLeadership { reply } => {
                let confirmed = self.node.confirm_leadership().await;
                let _ = reply.send(confirmed);
            }
            Command::TakeSnapshot { reply } => {
                let result = {
                    let shared_core = self.node.shared_core();
                    let mut core = shared_core.lock().await;
                    core.take_snapshot().map_err(RaftError::Snapshot)
                };
                if let Err(RaftError::Snapshot(ref msg)) = result {
                    warn!("manual snapshot failed: {}", msg);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn run_election(&self) {
        let term = {
            let shared_core = self.node.shared_core();
            let core = shared_core.lock().await;
            core.current_term + 1
        };
        self.metrics.record_election_started(term, "timeout");

        self.node.start_election().await;
        let became_leader = self.node.request_votes().await;

        let (current_term, role) = {
            let shared_core = self.node.shared_core();
            let core = shared_core.lock().await;
            (core.current_term, core.role)
        };
        if became_leader {
            self.metrics.record_election_finished(current_term, "won");
            self.metrics
                .record_role_change("Candidate", "Leader", current_term);
            // Establish authority immediately.
            self.node.send_heartbeat().await;
        } else {
            let outcome = if role == NodeRole::Follower {
                "stepped_down"
            } else {
                "lost"
            };
            self.metrics.record_election_finished(current_term, outcome);
        }
    }

    async fn election_deadline(&self, timeout: Duration) -> Instant {
        let last_heartbeat = self.node.shared_core().lock().await.last_heartbeat;
        last_heartbeat + timeout
    }

    /// The deadline may have been pushed forward by a heartbeat that
    /// arrived while we slept; re-check before acting.
    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let last_heartbeat = self.node.shared_core().lock().await.last_heartbeat;
        Instant::now() >= last_heartbeat + timeout
    }

    /// Current role.
    pub async fn role(&self) -> NodeRole {
        self.node.role().await
    }

    /// Start an election directly (delegates to the node).
    pub async fn start_election(&self) {
        self.node.start_election().await;
    }

    /// Request votes from all peers (delegates to the node).
    pub async fn request_votes(&self) -> bool {
        self.node.request_votes().await
    }
}
