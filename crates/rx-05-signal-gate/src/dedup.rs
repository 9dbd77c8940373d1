//! Durable signal dedup.
//!
//! Strategies retry signal publication (the bus is at-least-once), so the
//! gate must remember which `signal_id`s it has already judged - across
//! restarts, for at least the strategy retry window.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

/// Default record TTL: 24 h, comfortably past any strategy retry window.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Dedup store failures.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Dedup store I/O: {0}")]
    Io(String),

    #[error("Dedup store corrupt: {0}")]
    Corrupt(String),
}

/// Key-value dedup with TTL.
pub trait DedupStore: Send + Sync {
    /// Record a signal id if fresh.
    ///
    /// Returns `true` if the id was unseen (and is now recorded), `false`
    /// if it is a duplicate within its TTL.
    fn check_and_record(&self, signal_id: &str, now_ms: i64) -> Result<bool, DedupError>;
}

/// In-memory dedup for tests.
#[derive(Default)]
pub struct MemoryDedupStore {
    ttl_ms: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl MemoryDedupStore {
    /// Store with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl DedupStore for MemoryDedupStore {
    fn check_and_record(&self, signal_id: &str, now_ms: i64) -> Result<bool, DedupError> {
        let mut seen = self.seen.lock();
        seen.retain(|_, &mut expires| expires > now_ms);
        if seen.contains_key(signal_id) {
            return Ok(false);
        }
        seen.insert(signal_id.to_string(), now_ms + self.ttl_ms);
        Ok(true)
    }
}

/// File-backed dedup: one bincode map, atomically rewritten on record.
pub struct FileDedupStore {
    path: PathBuf,
    ttl_ms: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl FileDedupStore {
    /// Open or create the store with the default TTL.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DedupError> {
        Self::with_ttl(path, DEFAULT_TTL_MS)
    }

    /// Open with a custom TTL (test hook).
    pub fn with_ttl<P: AsRef<Path>>(path: P, ttl_ms: i64) -> Result<Self, DedupError> {
        let path = path.as_ref().to_path_buf();
        let seen = match std::fs::read(&path) {
            Ok(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| DedupError::Corrupt(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(DedupError::Io(e.to_string())),
        };
        Ok(Self {
            path,
            ttl_ms,
            seen: Mutex::new(seen),
        })
    }

    fn persist(&self, seen: &HashMap<String, i64>) -> Result<(), DedupError> {
        let bytes = bincode::serialize(seen).map_err(|e| DedupError::Io(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DedupError::Io(e.to_string()))?;
        }
        let temp = self.path.with_extension("tmp");
        let mut file =
            std::fs::File::create(&temp).map_err(|e| DedupError::Io(e.to_string()))?;
        file.write_all(&bytes).map_err(|e| DedupError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| DedupError::Io(e.to_string()))?;
        std::fs::rename(&temp, &self.path).map_err(|e| DedupError::Io(e.to_string()))?;
        Ok(())
    }
}

impl DedupStore for FileDedupStore {
    fn check_and_record(&self, signal_id: &str, now_ms: i64) -> Result<bool, DedupError> {
        let mut seen = self.seen.lock();
        seen.retain(|_, &mut expires| expires > now_ms);
        if seen.contains_key(signal_id) {
            return Ok(false);
        }
        seen.insert(signal_id.to_string(), now_ms + self.ttl_ms);
        // Durable before the signal is acted on: a crash between record and
        // emit re-judges the signal, never double-emits after restart.
        self.persist(&seen).map(|()| true)
    }
}
