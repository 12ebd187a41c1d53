//! Storage layer for durable consensus state.
//!
//! - `MemoryStorage`: fast, in-memory storage for testing
//! - `FileStorage`: file-based storage with CRC32 checksums and snapshot
//!   backup rotation

pub mod file;
pub mod memory;
pub mod traits;

pub use traits::{Storage, StorageError};
