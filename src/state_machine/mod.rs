//! State machine layer coordinated by the replicated log.
//!
//! - `KeyVault`: the in-memory key-value table
//! - `RecordingStateMachine`: records applied commands for testing

pub mod traits;
pub mod vault;

pub use traits::{AppliedCommands, ApplyResult, RecordingStateMachine, Snapshotable, StateMachine};
