//! Double-entry construction and invariants.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_types::{FillEvent, Side};

/// Entry direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posting {
    Debit,
    Credit,
}

/// One leg of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: Uuid,
    pub account: String,
    pub posting: Posting,
    pub amount: Decimal,
}

/// One posted fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub transaction_id: Uuid,
    /// Primary key at the store; what makes replays no-ops.
    pub fill_id: String,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Gross notional; the amount carried by both legs.
    pub amount: Decimal,
    /// Fees ride on the transaction, not as a third leg.
    pub fees: Decimal,
    pub posted_at: i64,
}

/// Cash account key for an account.
#[must_use]
pub fn cash_account(account: &str) -> String {
    format!("cash:{account}")
}

/// Position account key for an (account, symbol).
#[must_use]
pub fn position_account(account: &str, symbol: &str) -> String {
    format!("position:{account}:{symbol}")
}

/// Build the transaction and its two legs for a fill.
///
/// A buy debits the position account and credits cash (assets move from
/// cash into the position); a sell mirrors it. Amounts on both legs are
/// equal by construction.
///
/// # Errors
///
/// A fill with non-positive quantity or price violates the posting
/// invariants and cannot be represented; that is a schema violation, not a
/// transient failure.
pub fn postings_for(
    account: &str,
    fill: &FillEvent,
    posted_at: i64,
) -> Result<(LedgerTransaction, [LedgerEntry; 2]), String> {
    if fill.filled_qty <= Decimal::ZERO {
        return Err(format!("fill {} has non-positive quantity", fill.fill_id));
    }
    if fill.fill_price <= Decimal::ZERO {
        return Err(format!("fill {} has non-positive price", fill.fill_id));
    }
    if fill.fees < Decimal::ZERO {
        return Err(format!("fill {} has negative fees", fill.fill_id));
    }

    let amount = fill.filled_qty * fill.fill_price;
    let transaction_id = Uuid::new_v4();
    let (debit_account, credit_account) = match fill.side {
        Side::Buy => (
            position_account(account, &fill.symbol),
            cash_account(account),
        ),
        Side::Sell => (
            cash_account(account),
            position_account(account, &fill.symbol),
        ),
    };

    let transaction = LedgerTransaction {
        transaction_id,
        fill_id: fill.fill_id.clone(),
        account: account.to_string(),
        symbol: fill.symbol.clone(),
        side: fill.side,
        quantity: fill.filled_qty,
        price: fill.fill_price,
        amount,
        fees: fill.fees,
        posted_at,
    };
    let entries = [
        LedgerEntry {
            transaction_id,
            account: debit_account,
            posting: Posting::Debit,
            amount,
        },
        LedgerEntry {
            transaction_id,
            account: credit_account,
            posting: Posting::Credit,
            amount,
        },
    ];
    Ok((transaction, entries))
}
