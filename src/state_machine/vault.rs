//! The key vault: an in-memory key-value table.
//!
//! Mutated only by the applier executing committed entries; reads on the
//! leader go straight to the map through `SharedKeyVault`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::command::Command;

use super::{ApplyResult, Snapshotable, StateMachine};

/// In-memory key-value table backing the state machine.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyVault {
    data: HashMap<String, String>,
}

impl KeyVault {
    pub fn new() -> Self {
        KeyVault {
            data: HashMap::new(),
        }
    }

    /// Read a value directly (leader reads bypass the log).
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Full copy of the table (debug surface).
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Shared vault usable both as the replicated state machine and for direct
/// leader reads.
pub type SharedKeyVault = Arc<Mutex<KeyVault>>;

impl StateMachine for KeyVault {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        match command {
            Command::Put { key, value } => {
                self.data.insert(key.clone(), value.clone());
                Ok(String::new())
            }
            // Deleting an absent key is a no-op, not an error.
            Command::Delete { key } => {
                self.data.remove(key);
                Ok(String::new())
            }
            Command::NoOp => Ok(String::new()),
        }
    }
}

impl Snapshotable for KeyVault {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.data).map_err(|e| format!("snapshot serialization failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let restored: HashMap<String, String> = serde_json::from_slice(data)
            .map_err(|e| format!("snapshot deserialization failed: {}", e))?;
        self.data = restored;
        Ok(())
    }
}

impl StateMachine for SharedKeyVault {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.lock().unwrap().apply(command)
    }
}

impl Snapshotable for SharedKeyVault {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.lock().unwrap().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().unwrap().restore(data)
    }
}
