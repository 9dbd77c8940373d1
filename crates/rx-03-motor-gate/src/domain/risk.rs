//! The risk guard: pipeline step eleven.
//!
//! Pure checks over a snapshot of account state. The breaker's sizing
//! multiplier scales the caps, so CAUTIOUS halves every limit without any
//! special-casing in the pipeline.

use rust_decimal::Decimal;

use shared_types::{CanonicalPolicy, IntentPayload};

/// Snapshot of the account state the guard judges against.
#[derive(Debug, Clone)]
pub struct RiskInputs {
    /// Reference price for notional (limit price, or last mark for market
    /// orders).
    pub reference_price: Decimal,
    /// Day's realized PnL across the book.
    pub daily_realized_pnl: Decimal,
    /// Gross committed notional across all symbols (held + pending).
    pub gross_exposure: Decimal,
    /// This symbol's committed quantity (held + pending, signed).
    pub symbol_committed_qty: Decimal,
    /// Account equity for leverage accounting.
    pub account_equity: Decimal,
}

/// Risk guard over one policy document.
pub struct RiskGuard;

impl RiskGuard {
    /// Check an intent against policy caps scaled by the breaker
    /// multiplier.
    ///
    /// Returns the human-readable violation on failure; the pipeline maps
    /// any violation to `risk_exceeded` with this detail.
    pub fn check(
        policy: &CanonicalPolicy,
        payload: &IntentPayload,
        multiplier: Decimal,
        inputs: &RiskInputs,
    ) -> Result<(), String> {
        let symbol_policy = policy
            .symbol(&payload.symbol)
            .ok_or_else(|| format!("symbol {} not whitelisted", payload.symbol))?;

        // Per-symbol notional cap, scaled.
        let notional = payload.notional_at(inputs.reference_price);
        let max_notional = symbol_policy.max_notional * multiplier;
        if notional > max_notional {
            return Err(format!(
                "notional {notional} exceeds cap {max_notional} for {}",
                payload.symbol
            ));
        }

        // Daily drawdown: once the cap is gone, nothing opens.
        if -inputs.daily_realized_pnl >= policy.strategy_daily_loss_cap {
            return Err(format!(
                "daily loss {} at or beyond cap {}",
                -inputs.daily_realized_pnl,
                policy.strategy_daily_loss_cap
            ));
        }

        // Account leverage across the whole book, scaled.
        if inputs.account_equity > Decimal::ZERO {
            let projected_exposure = inputs.gross_exposure + notional.abs();
            let max_exposure = inputs.account_equity
                * Decimal::from(policy.max_account_leverage)
                * multiplier;
            if projected_exposure > max_exposure {
                return Err(format!(
                    "projected exposure {projected_exposure} exceeds account limit {max_exposure}"
                ));
            }
        }

        // Position impact: the post-trade committed size must stay within
        // the symbol cap as well.
        let projected_qty = inputs.symbol_committed_qty + payload.side.sign() * payload.quantity;
        let projected_notional = (projected_qty * inputs.reference_price).abs();
        if projected_notional > max_notional {
            return Err(format!(
                "projected position notional {projected_notional} exceeds cap {max_notional} for {}",
                payload.symbol
            ));
        }

        Ok(())
    }
}
