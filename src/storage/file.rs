//! File-based storage for durable consensus state.
//!
//! Stores state in a node-scoped directory:
//! - `term` - current term with checksum
//! - `voted_for` - vote cast in the current term with checksum
//! - `log` - log entries (JSON lines, each line checksummed)
//! - `snapshot` - most recent snapshot, with rotated backups
//!   `snapshot.1` / `snapshot.2`
//!
//! Checksums detect corruption from partial writes. Snapshot replacement is
//! atomic (temp file + fsync + rename) and the previous version survives as
//! a backup; loading falls back through the backups when the primary is
//! unreadable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;

use super::{Storage, StorageError};

/// Snapshot versions kept on disk: the primary plus two backups.
const SNAPSHOT_BACKUPS: usize = 2;

/// Simple CRC32 checksum (IEEE polynomial).
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// File-based storage backend.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory, creating it if
    /// needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(FileStorage { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join("term")
    }

    fn voted_for_path(&self) -> PathBuf {
        self.dir.join("voted_for")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    fn snapshot_backup_path(&self, version: usize) -> PathBuf {
        self.dir.join(format!("snapshot.{}", version))
    }

    /// Write data with checksum: "{data} {crc32_hex}\n".
    fn write_with_checksum(&self, path: &Path, data: &str) -> Result<(), StorageError> {
        let checksum = crc32(data.as_bytes());
        let content = format!("{} {:08x}\n", data, checksum);
        self.atomic_write(path, content.as_bytes())
    }

    /// Read and verify checksum, returning the data portion.
    fn read_with_checksum(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let content = content.trim();

        if content.is_empty() {
            return Ok(None);
        }

        // Parse "{data} {checksum}"
        let parts: Vec<&str> = content.rsplitn(2, ' ').collect();
        if parts.len() != 2 {
            return Err(StorageError::Corruption(format!(
                "invalid format in {:?}: missing checksum",
                path
            )));
        }

        let checksum_str = parts[0];
        let data = parts[1];

        let stored_checksum = u32::from_str_radix(checksum_str, 16).map_err(|_| {
            StorageError::Corruption(format!("invalid checksum format in {:?}", path))
        })?;

        let computed_checksum = crc32(data.as_bytes());
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
                path, stored_checksum, computed_checksum
            )));
        }

        Ok(Some(data.to_string()))
    }

    /// Atomically replace a file (write to temp, fsync, rename).
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all()
            .map_err(|e| StorageError::Io(e.to_string()))?;

        fs::rename(&temp_path, path).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    /// Rewrite the whole log file with the given entries.
    fn rewrite_log(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut content = String::new();
        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            content.push_str(&format!("{} {:08x}\n", json, checksum));
        }
        self.atomic_write(&self.log_path(), content.as_bytes())
    }

    /// Rotate the current snapshot into the backup set:
    /// snapshot.1 -> snapshot.2, snapshot -> snapshot.1.
    fn rotate_snapshot_backups(&self) {
        for version in (1..=SNAPSHOT_BACKUPS).rev() {
            let from = if version == 1 {
                self.snapshot_path()
            } else {
                self.snapshot_backup_path(version - 1)
            };
            if from.exists() {
                let _ = fs::rename(&from, self.snapshot_backup_path(version));
            }
        }
    }

    fn read_snapshot_file(&self, path: &Path) -> Result<Option<Snapshot>, StorageError> {
        match self.read_with_checksum(path)? {
            None => Ok(None),
            Some(json) => {
                let snapshot: Snapshot = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Corruption(format!("invalid snapshot: {}", e)))?;
                Ok(Some(snapshot))
            }
        }
    }
}

impl Storage for FileStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        match self.read_with_checksum(&self.term_path())? {
            None => Ok(0),
            Some(data) => data
                .parse()
                .map_err(|e| StorageError::Corruption(format!("invalid term: {}", e))),
        }
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.write_with_checksum(&self.term_path(), &term.to_string())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        match self.read_with_checksum(&self.voted_for_path())? {
            None => Ok(None),
            Some(data) if data == "none" => Ok(None),
            Some(data) => {
                let id = data
                    .parse()
                    .map_err(|e| StorageError::Corruption(format!("invalid voted_for: {}", e)))?;
                Ok(Some(id))
            }
        }
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        let data = match voted_for {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        self.write_with_checksum(&self.voted_for_path(), &data)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StorageError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }

            // Each line: "{json} {checksum}"
            let parts: Vec<&str> = line.rsplitn(2, ' ').collect();
            if parts.len() != 2 {
                return Err(StorageError::Corruption(format!(
                    "invalid log format at line {}: missing checksum",
                    line_num + 1
                )));
            }

            let checksum_str = parts[0];
            let json = parts[1];

            let stored_checksum = u32::from_str_radix(checksum_str, 16).map_err(|_| {
                StorageError::Corruption(format!("invalid checksum format at line {}", line_num + 1))
            })?;

            let computed_checksum = crc32(json.as_bytes());
            if stored_checksum != computed_checksum {
                return Err(StorageError::Corruption(format!(
                    "checksum mismatch at line {}: stored {:08x}, computed {:08x}",
                    line_num + 1,
                    stored_checksum,
                    computed_checksum
                )));
            }

            let entry: LogEntry = serde_json::from_str(json).map_err(|e| {
                StorageError::Corruption(format!(
                    "invalid log entry at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            writeln!(file, "{} {:08x}", json, checksum)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        file.sync_all()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        let keep: Vec<_> = entries
            .into_iter()
            .filter(|e| e.index < from_index)
            .collect();
        self.rewrite_log(&keep)
    }

    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        let keep: Vec<_> = entries
            .into_iter()
            .filter(|e| e.index >= before_index)
            .collect();
        self.rewrite_log(&keep)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.read_snapshot_file(&self.snapshot_path()) {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) => warn!("primary snapshot unreadable, trying backups: {}", e),
        }
        for version in 1..=SNAPSHOT_BACKUPS {
            match self.read_snapshot_file(&self.snapshot_backup_path(version)) {
                Ok(Some(snapshot)) => {
                    warn!("recovered snapshot from backup version {}", version);
                    return Ok(Some(snapshot));
                }
                Ok(None) => {}
                Err(e) => warn!("snapshot backup {} unreadable: {}", version, e),
            }
        }
        // Nothing usable: the node starts empty and catches up from peers.
        Ok(None)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Io(format!("snapshot serialization error: {}", e)))?;
        self.rotate_snapshot_backups();
        self.write_with_checksum(&self.snapshot_path(), &json)
    }
}
