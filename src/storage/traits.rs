//! Storage abstraction for durable consensus state.
//!
//! The protocol requires `(current_term, voted_for)` and log entries to be
//! on stable storage before the corresponding RPC response is emitted.

use std::fmt;

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied).
    Io(String),
    /// Data corruption detected.
    Corruption(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(msg) => write!(f, "I/O error: {}", msg),
            StorageError::Corruption(msg) => write!(f, "data corruption: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Storage trait for durable consensus state.
///
/// Implementations must ensure durability: data must survive crashes, and
/// writes must be on stable storage when the call returns. Operations are
/// synchronous to keep the consensus core simple; the `Send` bound is
/// required for use behind the node mutex in async contexts.
pub trait Storage: Send {
    /// Load the current term. Returns 0 on a fresh start.
    fn load_term(&self) -> Result<u64, StorageError>;

    /// Save the current term. Must be durable before returning.
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Load the vote cast in the current term, if any.
    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    /// Save the vote. Must be durable before returning.
    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Load all persisted log entries.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries.
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= `from_index`. Used for conflict
    /// resolution when a follower's log diverges from the leader's.
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// Remove all entries with index < `before_index`. Used for
    /// snapshot-based log compaction.
    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError>;

    /// Load the most recent readable snapshot, falling back to backup
    /// versions if the primary is corrupt. Returns None when nothing
    /// usable exists.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Save a snapshot, atomically replacing the previous one and rotating
    /// it into the backup set. Must be durable before returning.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
