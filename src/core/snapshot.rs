//! Snapshot types for log compaction.
//!
//! A snapshot captures the state machine at a specific log index so all
//! entries at or below that index can be discarded.

use serde::{Deserialize, Serialize};

/// Metadata describing what a snapshot supersedes and when it was taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Last log index included in this snapshot.
    pub last_included_index: u64,
    /// Term of the last included log entry.
    pub last_included_term: u64,
    /// Node term at the moment the snapshot was created.
    pub created_term: u64,
    /// Creation time, unix-epoch milliseconds.
    pub created_at: u64,
}

/// A snapshot of the state machine at a specific point in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Serialized state machine data.
    pub data: Vec<u8>,
}
