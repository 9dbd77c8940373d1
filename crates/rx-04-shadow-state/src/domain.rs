//! Position arithmetic.
//!
//! Pure value math on one position: average-entry tracking, realized PnL on
//! reductions, flips, and reconciler replacement. All mutation goes through
//! these methods so the `version_counter` can never be skipped.

use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared_types::{FillEvent, Side};

/// Shadow-state failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShadowError {
    /// Fill for a different symbol applied to this position.
    #[error("Fill symbol {fill} does not match position symbol {position}")]
    SymbolMismatch { fill: String, position: String },

    /// Snapshot persistence failure.
    #[error("Snapshot: {0}")]
    Snapshot(String),
}

/// One (account, symbol) position as the Motor believes it to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowPosition {
    pub account: String,
    pub symbol: String,
    /// Signed size: positive long, negative short, zero flat.
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Milliseconds since epoch of the last reconciler confirmation.
    pub last_synced_at: i64,
    /// Bumped on every mutation; used to detect torn writes in snapshots.
    pub version_counter: u64,
    /// Signed quantity acked at the exchange but not yet filled.
    pub pending_qty: Decimal,
}

impl ShadowPosition {
    /// A flat position.
    #[must_use]
    pub fn flat(account: &str, symbol: &str) -> Self {
        Self {
            account: account.to_string(),
            symbol: symbol.to_string(),
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            last_synced_at: 0,
            version_counter: 0,
            pending_qty: Decimal::ZERO,
        }
    }

    /// Whether the position is flat with nothing pending.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.size.is_zero() && self.pending_qty.is_zero()
    }

    /// Record an exchange ack: quantity is now pending at the venue.
    pub fn apply_ack(&mut self, side: Side, quantity: Decimal) {
        self.pending_qty += side.sign() * quantity;
        self.version_counter += 1;
    }

    /// Fold a fill into the position.
    ///
    /// Increasing fills move the average entry; reducing fills realize PnL
    /// against it; a fill through zero flips the position and the remainder
    /// opens at the fill price. Fees always reduce realized PnL.
    pub fn apply_fill(&mut self, fill: &FillEvent) -> Result<(), ShadowError> {
        if fill.symbol != self.symbol {
            return Err(ShadowError::SymbolMismatch {
                fill: fill.symbol.clone(),
                position: self.symbol.clone(),
            });
        }

        let signed_qty = fill.side.sign() * fill.filled_qty;
        let same_direction = self.size.is_zero() || (self.size.signum() == signed_qty.signum());

        if same_direction {
            let old_abs = self.size.abs();
            let new_abs = old_abs + fill.filled_qty;
            if !new_abs.is_zero() {
                self.avg_entry_price =
                    (old_abs * self.avg_entry_price + fill.filled_qty * fill.fill_price) / new_abs;
            }
            self.size += signed_qty;
        } else {
            let closing_qty = fill.filled_qty.min(self.size.abs());
            // PnL per unit is entry-relative and sign-sensitive.
            self.realized_pnl +=
                closing_qty * (fill.fill_price - self.avg_entry_price) * self.size.signum();
            self.size += signed_qty;
            if self.size.is_zero() {
                self.avg_entry_price = Decimal::ZERO;
            } else if self.size.signum() == signed_qty.signum() {
                // Flipped through zero: remainder opens at the fill price.
                self.avg_entry_price = fill.fill_price;
            }
        }

        self.realized_pnl -= fill.fees;
        // The fill consumes its share of pending exposure.
        self.pending_qty -= signed_qty;
        if self.pending_qty.signum() != signed_qty.signum() && !self.pending_qty.is_zero() {
            // Fills beyond what was acked (manual orders, partial view):
            // clamp rather than carry phantom exposure.
            self.pending_qty = Decimal::ZERO;
        }
        self.version_counter += 1;
        Ok(())
    }

    /// Mark-to-market the unrealized PnL.
    pub fn mark(&mut self, mark_price: Decimal) {
        self.unrealized_pnl = (mark_price - self.avg_entry_price) * self.size;
        self.version_counter += 1;
    }

    /// Reconciler replacement: the exchange value is truth.
    pub fn replace_from_exchange(
        &mut self,
        size: Decimal,
        avg_entry_price: Decimal,
        synced_at: i64,
    ) {
        self.size = size;
        self.avg_entry_price = avg_entry_price;
        self.pending_qty = Decimal::ZERO;
        self.last_synced_at = synced_at;
        self.version_counter += 1;
    }

    /// Total exposure the risk guard charges for this position: held plus
    /// pending, in the same direction.
    #[must_use]
    pub fn committed_qty(&self) -> Decimal {
        self.size + self.pending_qty
    }
}
