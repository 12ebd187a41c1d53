//! Consensus engine: commands, log, roles, replication, snapshots.

pub mod command;
pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix-epoch milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
