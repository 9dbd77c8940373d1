//! Durable consumer cursors.
//!
//! A cursor records the highest stream sequence a consumer has fully
//! processed. On reconnect the consumer resumes from its cursor; everything
//! after it is replayed, so processing must tolerate redelivery.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::publisher::BusError;
use crate::stream::Stream;

/// Store of (consumer, stream) -> last processed sequence.
pub trait CursorStore: Send + Sync {
    /// Load a cursor; 0 means "never consumed".
    fn load(&self, consumer: &str, stream: Stream) -> Result<u64, BusError>;

    /// Persist a cursor. Must be durable before returning.
    fn commit(&self, consumer: &str, stream: Stream, sequence: u64) -> Result<(), BusError>;
}

/// In-memory store for tests and ephemeral consumers.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<(String, Stream), u64>>,
}

impl MemoryCursorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, consumer: &str, stream: Stream) -> Result<u64, BusError> {
        Ok(*self
            .cursors
            .lock()
            .get(&(consumer.to_string(), stream))
            .unwrap_or(&0))
    }

    fn commit(&self, consumer: &str, stream: Stream, sequence: u64) -> Result<(), BusError> {
        self.cursors
            .lock()
            .insert((consumer.to_string(), stream), sequence);
        Ok(())
    }
}

/// File-backed store: one bincode map, rewritten atomically via temp file +
/// rename + fsync.
pub struct FileCursorStore {
    path: PathBuf,
    cursors: Mutex<HashMap<(String, Stream), u64>>,
}

impl FileCursorStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BusError> {
        let path = path.as_ref().to_path_buf();
        let cursors = match std::fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| BusError::CursorStore(format!("cursor file corrupt: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(BusError::CursorStore(e.to_string())),
        };
        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
        })
    }

    fn persist(&self, cursors: &HashMap<(String, Stream), u64>) -> Result<(), BusError> {
        let bytes = bincode::serialize(cursors)
            .map_err(|e| BusError::CursorStore(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BusError::CursorStore(e.to_string()))?;
        }
        let temp = self.path.with_extension("tmp");
        let mut file =
            std::fs::File::create(&temp).map_err(|e| BusError::CursorStore(e.to_string()))?;
        file.write_all(&bytes)
            .map_err(|e| BusError::CursorStore(e.to_string()))?;
        file.sync_all()
            .map_err(|e| BusError::CursorStore(e.to_string()))?;
        std::fs::rename(&temp, &self.path).map_err(|e| BusError::CursorStore(e.to_string()))?;
        Ok(())
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self, consumer: &str, stream: Stream) -> Result<u64, BusError> {
        Ok(*self
            .cursors
            .lock()
            .get(&(consumer.to_string(), stream))
            .unwrap_or(&0))
    }

    fn commit(&self, consumer: &str, stream: Stream, sequence: u64) -> Result<(), BusError> {
        let mut cursors = self.cursors.lock();
        cursors.insert((consumer.to_string(), stream), sequence);
        self.persist(&cursors)
    }
}
