//! Storage port: a key-value store with atomic multi-key batches.

use thiserror::Error;

/// Store failures. All transient from the ledger's point of view; the
/// caller decides whether to retry or surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KVStoreError {
    #[error("KV store I/O: {message}")]
    IOError { message: String },

    #[error("KV store corrupt: {message}")]
    Corrupt { message: String },
}

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Key-value storage with an atomic write batch.
///
/// `write_batch` is the transactional envelope the ledger builds on: every
/// operation in the batch becomes visible together, or none do.
pub trait KeyValueStore: Send + Sync {
    /// Read one key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError>;

    /// Apply a batch atomically. Durable before returning.
    fn write_batch(&self, ops: Vec<BatchOperation>) -> Result<(), KVStoreError>;

    /// All pairs whose key starts with `prefix`, unordered.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError>;
}
