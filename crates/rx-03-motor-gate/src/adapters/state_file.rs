//! File-backed durable Motor state.
//!
//! One directory holds the armed file, the breaker file, the replay-guard
//! snapshot, and the operator audit log. Every write goes through a temp
//! file, fsync, and rename, so a crash leaves either the old state or the
//! new one. An advisory lock on the directory keeps two Motors from sharing
//! state.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use shared_types::{ArmedState, BreakerState, ReplayGuardSnapshot};

use crate::ports::{StateStore, StateStoreError};

const ARMED_FILE: &str = "armed.state";
const BREAKER_FILE: &str = "breaker.state";
const REPLAY_FILE: &str = "replay.snapshot";
const AUDIT_FILE: &str = "operator-audit.log";

/// Durable state rooted at one directory.
pub struct FileStateStore {
    dir: PathBuf,
    _lock: std::fs::File,
}

impl FileStateStore {
    /// Open (or initialize) the state directory, taking its lock.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StateStoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StateStoreError::Io(e.to_string()))?;
        let lock = std::fs::File::create(dir.join(".lock"))
            .map_err(|e| StateStoreError::Io(e.to_string()))?;
        lock.try_lock_exclusive()
            .map_err(|_| StateStoreError::Io("state directory locked by another process".to_string()))?;
        Ok(Self { dir, _lock: lock })
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StateStoreError> {
        let path = self.dir.join(name);
        let temp = path.with_extension("tmp");
        let mut file =
            std::fs::File::create(&temp).map_err(|e| StateStoreError::Io(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| StateStoreError::Io(e.to_string()))?;
        file.sync_all()
            .map_err(|e| StateStoreError::Io(e.to_string()))?;
        std::fs::rename(&temp, &path).map_err(|e| StateStoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn read_or<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        default: T,
    ) -> Result<T, StateStoreError> {
        match std::fs::read(self.dir.join(name)) {
            Ok(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| StateStoreError::Corrupt(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default),
            Err(e) => Err(StateStoreError::Io(e.to_string())),
        }
    }
}

impl StateStore for FileStateStore {
    fn load_armed(&self) -> Result<ArmedState, StateStoreError> {
        // Absent file means the default: DISARMED. Fail closed.
        self.read_or(ARMED_FILE, ArmedState::Disarmed)
    }

    fn store_armed(&self, state: ArmedState) -> Result<(), StateStoreError> {
        let bytes =
            bincode::serialize(&state).map_err(|e| StateStoreError::Io(e.to_string()))?;
        self.write_atomic(ARMED_FILE, &bytes)
    }

    fn load_breaker(&self) -> Result<BreakerState, StateStoreError> {
        self.read_or(BREAKER_FILE, BreakerState::Normal)
    }

    fn store_breaker(&self, state: BreakerState) -> Result<(), StateStoreError> {
        let bytes =
            bincode::serialize(&state).map_err(|e| StateStoreError::Io(e.to_string()))?;
        self.write_atomic(BREAKER_FILE, &bytes)
    }

    fn load_replay(&self) -> Result<ReplayGuardSnapshot, StateStoreError> {
        self.read_or(REPLAY_FILE, ReplayGuardSnapshot::default())
    }

    fn store_replay(&self, snapshot: &ReplayGuardSnapshot) -> Result<(), StateStoreError> {
        let bytes =
            bincode::serialize(snapshot).map_err(|e| StateStoreError::Io(e.to_string()))?;
        self.write_atomic(REPLAY_FILE, &bytes)
    }

    fn append_audit(&self, line: &str) -> Result<(), StateStoreError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(AUDIT_FILE))
            .map_err(|e| StateStoreError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| StateStoreError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StateStoreError::Io(e.to_string()))?;
        Ok(())
    }
}
