//! State machine abstraction.
//!
//! The state machine is the application logic the consensus engine
//! coordinates. Committed log entries are applied to it in strict index
//! order, exactly once per process lifetime.

use std::sync::{Arc, Mutex};

use crate::core::command::Command;

/// Result of applying a command: Ok(output) or Err(message).
pub type ApplyResult = Result<String, String>;

/// State machine trait.
///
/// Implementations must be deterministic: applying the same commands in the
/// same order must produce the same state on every node.
pub trait StateMachine: Send {
    /// Apply a committed command.
    fn apply(&mut self, command: &Command) -> ApplyResult;
}

/// Snapshotable state machine, required for log compaction.
pub trait Snapshotable: StateMachine {
    /// Serialize the current state to bytes.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with the deserialized snapshot data.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for tests.
pub type AppliedCommands = Arc<Mutex<Vec<Command>>>;

/// Test state machine that records every applied command to a shared vec.
pub struct RecordingStateMachine {
    applied: AppliedCommands,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        RecordingStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec so tests can inspect applied commands.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        RecordingStateMachine { applied }
    }
}

impl Default for RecordingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.applied.lock().unwrap().push(command.clone());
        Ok(String::new())
    }
}

impl Snapshotable for RecordingStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let applied = self.applied.lock().unwrap().clone();
        serde_json::to_vec(&applied)
            .map_err(|e| format!("recording state machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<Command> = serde_json::from_slice(data)
            .map_err(|e| format!("recording state machine restore failed: {}", e))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }
}
