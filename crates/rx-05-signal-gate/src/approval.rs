//! The approval chain.
//!
//! Five ordered checks; the first refusal wins and its reason is what the
//! gate logs. The flow validator and regime gate are opaque yes/no
//! collaborators here - their internals belong to the strategy research
//! side of the fence.

use rust_decimal::Decimal;

use shared_types::{CanonicalPolicy, SignalEvent};

/// Is a strategy currently enabled?
pub trait StrategyRegistry: Send + Sync {
    fn is_active(&self, strategy_id: &str) -> bool;
}

/// Opaque oracle/flow permission.
pub trait FlowValidator: Send + Sync {
    fn permits(&self, signal: &SignalEvent) -> bool;
}

/// Opaque market-regime permission.
pub trait RegimeGate: Send + Sync {
    fn permits(&self, symbol: &str) -> bool;
}

/// Everything the chain consults.
pub struct ApprovalPorts<R, F, G>
where
    R: StrategyRegistry,
    F: FlowValidator,
    G: RegimeGate,
{
    pub strategies: R,
    pub flow: F,
    pub regime: G,
}

/// The ordered chain itself.
pub struct ApprovalChain;

impl ApprovalChain {
    /// Judge one deduplicated signal.
    ///
    /// `current_exposure` is the portfolio's gross committed notional as
    /// the Cortex currently estimates it; the Motor re-checks against
    /// shadow state regardless, so this is the cheap early filter, not the
    /// enforcement point.
    pub fn approve<R, F, G>(
        policy: &CanonicalPolicy,
        ports: &ApprovalPorts<R, F, G>,
        signal: &SignalEvent,
        current_exposure: Decimal,
        equity: Decimal,
    ) -> Result<(), String>
    where
        R: StrategyRegistry,
        F: FlowValidator,
        G: RegimeGate,
    {
        // 1. Symbol allowed.
        let Some(symbol_policy) = policy.symbol(&signal.symbol) else {
            return Err(format!("symbol {} not whitelisted", signal.symbol));
        };

        // 2. Strategy active.
        if !ports.strategies.is_active(&signal.strategy_id) {
            return Err(format!("strategy {} inactive", signal.strategy_id));
        }

        // 3. Portfolio exposure permits.
        if let Some(price) = signal.limit_price {
            let projected = current_exposure + (signal.quantity * price).abs();
            let cap = equity * Decimal::from(policy.max_account_leverage);
            if equity > Decimal::ZERO && projected > cap {
                return Err(format!("projected exposure {projected} exceeds {cap}"));
            }
            if (signal.quantity * price).abs() > symbol_policy.max_notional {
                return Err(format!(
                    "signal notional exceeds {} cap for {}",
                    symbol_policy.max_notional, signal.symbol
                ));
            }
        }
        if signal.leverage > symbol_policy.max_leverage {
            return Err(format!(
                "leverage {} exceeds {} for {}",
                signal.leverage, symbol_policy.max_leverage, signal.symbol
            ));
        }

        // 4. Oracle / flow validator.
        if !ports.flow.permits(signal) {
            return Err("flow validator refused".to_string());
        }

        // 5. Regime permits.
        if !ports.regime.permits(&signal.symbol) {
            return Err(format!("regime forbids {}", signal.symbol));
        }

        Ok(())
    }
}

/// Everything-open ports for tests and bring-up.
pub struct OpenPorts;

impl StrategyRegistry for OpenPorts {
    fn is_active(&self, _strategy_id: &str) -> bool {
        true
    }
}

impl FlowValidator for OpenPorts {
    fn permits(&self, _signal: &SignalEvent) -> bool {
        true
    }
}

impl RegimeGate for OpenPorts {
    fn permits(&self, _symbol: &str) -> bool {
        true
    }
}
