//! Driven ports for the reconciler.

use async_trait::async_trait;
use rust_decimal::Decimal;

use shared_types::DriftEvent;

/// A position as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed size.
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    /// Mark price if the venue reports one.
    pub mark_price: Option<Decimal>,
}

/// Read-only exchange position access. This is the only exchange surface the
/// reconciler touches; order placement lives in the Motor gate alone.
#[async_trait]
pub trait PositionReader: Send + Sync {
    /// Fetch all open positions for an account.
    async fn positions(&self, account: &str) -> Result<Vec<ExchangePosition>, String>;
}

/// Where drift reports go: onto the bus, and into the drift detector which
/// decides whether the breaker escalates.
#[async_trait]
pub trait DriftSink: Send + Sync {
    /// Report one confirmed drift observation.
    async fn report(&self, event: DriftEvent);
}
