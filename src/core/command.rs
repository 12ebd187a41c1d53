//! Replicated commands applied to the key vault.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A command carried by a log entry.
///
/// `NoOp` entries are appended by a fresh leader so entries from previous
/// terms can be committed indirectly; they leave the vault untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    NoOp,
}

impl Command {
    /// Validate the command before it is applied to the state machine.
    /// `Put` and `Delete` require a non-empty key; the value of a `Put`
    /// may be empty but is always present by construction.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Command::Put { key, .. } | Command::Delete { key } if key.is_empty() => {
                Err("command requires a non-empty key".to_string())
            }
            _ => Ok(()),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Command::NoOp)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Put { key, .. } => write!(f, "PUT {}", key),
            Command::Delete { key } => write!(f, "DELETE {}", key),
            Command::NoOp => write!(f, "NOOP"),
        }
    }
}
