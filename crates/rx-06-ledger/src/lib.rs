//! # RX-06 Accounting Ledger
//!
//! Receives fill events and posts them as double-entry transactions.
//!
//! ## The critical invariant
//!
//! Fill insertion and ledger posting are ONE atomic unit. `process_fill`
//! either persists the fill row, the transaction row, and both entries in a
//! single store batch, or persists nothing and signals a retryable failure.
//! The bus acknowledgement happens only after the batch commits, so a crash
//! at any point yields redelivery, and redelivery is safe because `fill_id`
//! is the primary key: replays are a no-op success.
//!
//! ## Posting shape
//!
//! Exactly one debit and one credit per transaction, equal amounts (the
//! fill's gross notional). A buy debits the symbol's position account and
//! credits the cash account; a sell is the mirror image. Fees ride on the
//! transaction row rather than as a third leg.
//!
//! Fill processing is serialized per account to keep balance arithmetic
//! exact; different accounts post in parallel.

pub mod adapters;
pub mod consumer;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{FileKVStore, MemoryKVStore};
pub use consumer::LedgerConsumer;
pub use domain::{LedgerEntry, LedgerTransaction, Posting};
pub use ports::{BatchOperation, KVStoreError, KeyValueStore};
pub use service::{Ledger, LedgerError, ProcessOutcome};
