//! The ledger service: `process_fill` and balance queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use shared_types::{FillEvent, LEDGER_DEADLINE_MS};

use crate::domain::{postings_for, LedgerEntry, LedgerTransaction, Posting};
use crate::ports::{BatchOperation, KeyValueStore};

/// Ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Store trouble: retryable, the fill event must not be acked.
    #[error("Ledger store: {0}")]
    Store(String),

    /// The transaction exceeded its commit deadline: retryable.
    #[error("Ledger transaction exceeded {0} ms deadline")]
    Deadline(u64),

    /// Posting invariant violated: terminal, dead-letter the event.
    #[error("Posting invariant violated: {0}")]
    Invariant(String),
}

impl LedgerError {
    /// Whether redelivery can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, LedgerError::Invariant(_))
    }
}

/// `process_fill` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Fill row, transaction, and both legs committed.
    Posted,
    /// `fill_id` already present: replay absorbed, nothing changed.
    AlreadyPosted,
}

fn fill_key(fill_id: &str) -> Vec<u8> {
    format!("fills/{fill_id}").into_bytes()
}

fn txn_key(transaction_id: &uuid::Uuid) -> Vec<u8> {
    format!("ledger_transactions/{transaction_id}").into_bytes()
}

fn entry_key(transaction_id: &uuid::Uuid, posting: Posting) -> Vec<u8> {
    let leg = match posting {
        Posting::Debit => "debit",
        Posting::Credit => "credit",
    };
    format!("ledger_entries/{transaction_id}/{leg}").into_bytes()
}

fn balance_key(account: &str) -> Vec<u8> {
    format!("balances/{account}").into_bytes()
}

/// The ledger, generic over its store.
pub struct Ledger<S: KeyValueStore> {
    store: Arc<S>,
    account: String,
    /// Per-account serialization: balance arithmetic must not interleave.
    account_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: KeyValueStore> Ledger<S> {
    /// Ledger for one trading account.
    #[must_use]
    pub fn new(store: Arc<S>, account: &str) -> Self {
        Self {
            store,
            account: account.to_string(),
            account_locks: RwLock::new(HashMap::new()),
        }
    }

    fn account_lock(&self, account: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.account_locks.read().get(account) {
            return Arc::clone(lock);
        }
        let mut locks = self.account_locks.write();
        Arc::clone(
            locks
                .entry(account.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Post one fill: fill row + transaction + both legs + balance updates
    /// in a single atomic batch, under the account's lock and the ledger
    /// deadline.
    pub async fn process_fill(&self, fill: &FillEvent) -> Result<ProcessOutcome, LedgerError> {
        let work = self.process_fill_inner(fill);
        tokio::time::timeout(Duration::from_millis(LEDGER_DEADLINE_MS), work)
            .await
            .map_err(|_| LedgerError::Deadline(LEDGER_DEADLINE_MS))?
    }

    async fn process_fill_inner(&self, fill: &FillEvent) -> Result<ProcessOutcome, LedgerError> {
        let lock = self.account_lock(&self.account);
        let _guard = lock.lock().await;

        // Idempotency first: a known fill_id is a successful no-op.
        if self
            .store
            .get(&fill_key(&fill.fill_id))
            .map_err(|e| LedgerError::Store(e.to_string()))?
            .is_some()
        {
            debug!(fill_id = %fill.fill_id, "Fill replay absorbed");
            return Ok(ProcessOutcome::AlreadyPosted);
        }

        let (transaction, entries) =
            postings_for(&self.account, fill, shared_types::now_ms())
                .map_err(LedgerError::Invariant)?;
        debug_assert_eq!(entries[0].amount, entries[1].amount);

        let mut ops = vec![
            BatchOperation::Put {
                key: fill_key(&fill.fill_id),
                value: encode(fill)?,
            },
            BatchOperation::Put {
                key: txn_key(&transaction.transaction_id),
                value: encode(&transaction)?,
            },
        ];
        for entry in &entries {
            ops.push(BatchOperation::Put {
                key: entry_key(&entry.transaction_id, entry.posting),
                value: encode(entry)?,
            });
            // Balance rows move inside the same atomic boundary.
            let delta = match entry.posting {
                Posting::Debit => entry.amount,
                Posting::Credit => -entry.amount,
            };
            let current = self.balance(&entry.account)?;
            ops.push(BatchOperation::Put {
                key: balance_key(&entry.account),
                value: encode(&(current + delta))?,
            });
        }

        // The single commit point. Everything above was reads and staging.
        self.store
            .write_batch(ops)
            .map_err(|e| LedgerError::Store(e.to_string()))?;

        info!(
            fill_id = %fill.fill_id,
            transaction_id = %transaction.transaction_id,
            amount = %transaction.amount,
            "Fill posted"
        );
        Ok(ProcessOutcome::Posted)
    }

    /// Current balance of a ledger account (0 if never touched).
    pub fn balance(&self, account: &str) -> Result<Decimal, LedgerError> {
        match self
            .store
            .get(&balance_key(account))
            .map_err(|e| LedgerError::Store(e.to_string()))?
        {
            Some(bytes) => decode(&bytes),
            None => Ok(Decimal::ZERO),
        }
    }

    /// The stored fill row, if posted.
    pub fn fill(&self, fill_id: &str) -> Result<Option<FillEvent>, LedgerError> {
        match self
            .store
            .get(&fill_key(fill_id))
            .map_err(|e| LedgerError::Store(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All posted transactions (audit surface).
    pub fn transactions(&self) -> Result<Vec<LedgerTransaction>, LedgerError> {
        self.store
            .scan_prefix(b"ledger_transactions/")
            .map_err(|e| LedgerError::Store(e.to_string()))?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    /// Both legs of a transaction.
    pub fn entries(&self, transaction_id: &uuid::Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store
            .scan_prefix(format!("ledger_entries/{transaction_id}/").as_bytes())
            .map_err(|e| LedgerError::Store(e.to_string()))?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, LedgerError> {
    bincode::serialize(value).map_err(|e| LedgerError::Store(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, LedgerError> {
    bincode::deserialize(bytes).map_err(|e| LedgerError::Store(e.to_string()))
}
