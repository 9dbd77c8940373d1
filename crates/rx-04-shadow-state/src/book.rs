//! The shadow book: per-symbol serialized access to positions.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use shared_types::{FillEvent, Side};

use crate::domain::{ShadowError, ShadowPosition};

/// All shadow positions for one account, with per-symbol locking.
///
/// The outer map is guarded by a `RwLock` only long enough to find or insert
/// the symbol's entry; the per-symbol `tokio::Mutex` serializes actual
/// mutations, so updates to different symbols run in parallel while updates
/// to one symbol never interleave.
pub struct ShadowBook {
    account: String,
    positions: RwLock<HashMap<String, Arc<Mutex<ShadowPosition>>>>,
}

impl ShadowBook {
    /// Empty book for an account.
    #[must_use]
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// The account this book mirrors.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    fn entry(&self, symbol: &str) -> Arc<Mutex<ShadowPosition>> {
        if let Some(entry) = self.positions.read().get(symbol) {
            return Arc::clone(entry);
        }
        let mut guard = self.positions.write();
        Arc::clone(guard.entry(symbol.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ShadowPosition::flat(&self.account, symbol)))
        }))
    }

    /// Record an exchange ack.
    pub async fn apply_ack(&self, symbol: &str, side: Side, quantity: Decimal) {
        let entry = self.entry(symbol);
        let mut position = entry.lock().await;
        position.apply_ack(side, quantity);
        debug!(symbol, pending = %position.pending_qty, "Ack applied to shadow");
    }

    /// Fold a fill into the book.
    pub async fn apply_fill(&self, fill: &FillEvent) -> Result<(), ShadowError> {
        let entry = self.entry(&fill.symbol);
        let mut position = entry.lock().await;
        position.apply_fill(fill)?;
        debug!(
            symbol = %fill.symbol,
            size = %position.size,
            realized = %position.realized_pnl,
            "Fill applied to shadow"
        );
        Ok(())
    }

    /// Reconciler replacement under the symbol lock: atomic from the
    /// pipeline's perspective.
    pub async fn replace_from_exchange(
        &self,
        symbol: &str,
        size: Decimal,
        avg_entry_price: Decimal,
        synced_at: i64,
    ) {
        let entry = self.entry(symbol);
        let mut position = entry.lock().await;
        position.replace_from_exchange(size, avg_entry_price, synced_at);
    }

    /// Mark-to-market one symbol.
    pub async fn mark(&self, symbol: &str, mark_price: Decimal) {
        let entry = self.entry(symbol);
        entry.lock().await.mark(mark_price);
    }

    /// Copy of one position, if tracked.
    pub async fn position(&self, symbol: &str) -> Option<ShadowPosition> {
        let entry = {
            let guard = self.positions.read();
            guard.get(symbol).cloned()
        };
        match entry {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    /// Copies of all tracked positions.
    pub async fn all_positions(&self) -> Vec<ShadowPosition> {
        let entries: Vec<Arc<Mutex<ShadowPosition>>> =
            self.positions.read().values().cloned().collect();
        let mut positions = Vec::with_capacity(entries.len());
        for entry in entries {
            positions.push(entry.lock().await.clone());
        }
        positions
    }

    /// Positions with non-zero size (flatten-all targets).
    pub async fn open_positions(&self) -> Vec<ShadowPosition> {
        self.all_positions()
            .await
            .into_iter()
            .filter(|p| !p.size.is_zero())
            .collect()
    }

    /// Sum of realized PnL across the book (daily-loss input).
    pub async fn total_realized_pnl(&self) -> Decimal {
        self.all_positions()
            .await
            .iter()
            .map(|p| p.realized_pnl)
            .sum()
    }

    /// Total absolute committed notional at the given entry prices.
    pub async fn gross_exposure(&self) -> Decimal {
        self.all_positions()
            .await
            .iter()
            .map(|p| (p.committed_qty() * p.avg_entry_price).abs())
            .sum()
    }

    /// Persist a snapshot of every position.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), ShadowError> {
        let positions = self.all_positions().await;
        let bytes =
            bincode::serialize(&positions).map_err(|e| ShadowError::Snapshot(e.to_string()))?;
        write_atomic(path, &bytes).map_err(|e| ShadowError::Snapshot(e.to_string()))
    }

    /// Restore a book from a snapshot file. Missing file yields an empty
    /// book; a corrupt one refuses.
    pub fn load_snapshot(account: &str, path: &Path) -> Result<Self, ShadowError> {
        let book = Self::new(account);
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(book),
            Err(e) => return Err(ShadowError::Snapshot(e.to_string())),
        };
        let positions: Vec<ShadowPosition> =
            bincode::deserialize(&bytes).map_err(|e| ShadowError::Snapshot(e.to_string()))?;
        {
            let mut guard = book.positions.write();
            for position in positions {
                guard.insert(position.symbol.clone(), Arc::new(Mutex::new(position)));
            }
        }
        Ok(book)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp: PathBuf = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&temp, path)
}
