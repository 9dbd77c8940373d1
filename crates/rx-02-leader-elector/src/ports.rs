//! Driven ports: time and term persistence.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::service::ElectorError;

/// Time source, substitutable for deterministic tests.
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time source.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        shared_types::now_ms()
    }
}

/// Durable store for the highest term ever used by this candidate.
///
/// The persisted value only ratchets upward; losing it would let a restarted
/// replica claim a term the Motor has already fenced out.
pub trait TermStore: Send + Sync {
    /// Load the highest persisted term (0 if never promoted).
    fn load(&self) -> Result<u64, ElectorError>;

    /// Persist a term. Durable before returning; never writes a smaller
    /// value than already stored.
    fn store(&self, term: u64) -> Result<(), ElectorError>;
}

/// In-memory term store for tests.
#[derive(Debug, Default)]
pub struct MemoryTermStore {
    term: Mutex<u64>,
}

impl MemoryTermStore {
    /// Create a store starting at term 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TermStore for MemoryTermStore {
    fn load(&self) -> Result<u64, ElectorError> {
        Ok(*self.term.lock())
    }

    fn store(&self, term: u64) -> Result<(), ElectorError> {
        let mut guard = self.term.lock();
        *guard = (*guard).max(term);
        Ok(())
    }
}

/// File-backed term store with atomic replace.
pub struct FileTermStore {
    path: PathBuf,
}

impl FileTermStore {
    /// Bind to a term file (created on first store).
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TermStore for FileTermStore {
    fn load(&self) -> Result<u64, ElectorError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| ElectorError::TermStore("term file corrupt".to_string()))?;
                Ok(u64::from_le_bytes(arr))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(ElectorError::TermStore(e.to_string())),
        }
    }

    fn store(&self, term: u64) -> Result<(), ElectorError> {
        if term < self.load()? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ElectorError::TermStore(e.to_string()))?;
        }
        let temp = self.path.with_extension("tmp");
        let mut file =
            std::fs::File::create(&temp).map_err(|e| ElectorError::TermStore(e.to_string()))?;
        file.write_all(&term.to_le_bytes())
            .map_err(|e| ElectorError::TermStore(e.to_string()))?;
        file.sync_all()
            .map_err(|e| ElectorError::TermStore(e.to_string()))?;
        std::fs::rename(&temp, &self.path).map_err(|e| ElectorError::TermStore(e.to_string()))?;
        Ok(())
    }
}
