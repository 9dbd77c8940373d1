//! Outbound port traits: exchange, events, durable state, keys, time.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use shared_types::{
    AcceptedEvent, ArmedState, BreakerState, DriftEvent, FillEvent, OrderType,
    PolicyAdvertisedEvent, RejectionEvent, ReplayGuardSnapshot, Side, StateChangeEvent,
};

/// An order as submitted to the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Exchange idempotency key: the intent id, so a retried submit can
    /// never double-place.
    pub idempotency_key: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
    pub client_order_tag: String,
}

/// Venue acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
}

/// Exchange submission failures, classified for the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network trouble or venue 5xx: retried up to the budget.
    #[error("Transient exchange error: {0}")]
    Transient(String),

    /// Venue 429. The local bucket is authoritative, so this indicates
    /// local/remote disagreement; it maps to the `rate_limited` taxonomy
    /// and is never retried inside the submit step.
    #[error("Exchange rate limit: {0}")]
    RateLimited(String),

    /// Venue 4xx: terminal for this intent.
    #[error("Exchange rejected order: {0}")]
    Fatal(String),
}

/// The trading surface of the venue. Only the Motor gate holds one of
/// these; every other component gets read-only access at most.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order. Implementations must honor the idempotency key.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Last mark price for a symbol (risk reference for market orders).
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Account equity for leverage accounting.
    async fn account_equity(&self, account: &str) -> Result<Decimal, ExchangeError>;
}

/// Where the Motor's events go. The bus adapter implements this; tests use
/// a recording sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn rejection(&self, event: RejectionEvent);
    async fn accepted(&self, event: AcceptedEvent);
    async fn fill(&self, event: FillEvent);
    async fn state_change(&self, event: StateChangeEvent);
    async fn policy_advertised(&self, event: PolicyAdvertisedEvent);
    async fn drift(&self, event: DriftEvent);
}

/// Durable state failures.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("State store I/O: {0}")]
    Io(String),

    #[error("State store corrupt: {0}")]
    Corrupt(String),
}

/// Durable Motor state: armed file, breaker file, replay-guard snapshot.
///
/// Write-through discipline: every store must be durable before it returns,
/// because the caller acknowledges the transition immediately after.
pub trait StateStore: Send + Sync {
    fn load_armed(&self) -> Result<ArmedState, StateStoreError>;
    fn store_armed(&self, state: ArmedState) -> Result<(), StateStoreError>;
    fn load_breaker(&self) -> Result<BreakerState, StateStoreError>;
    fn store_breaker(&self, state: BreakerState) -> Result<(), StateStoreError>;
    fn load_replay(&self) -> Result<ReplayGuardSnapshot, StateStoreError>;
    fn store_replay(&self, snapshot: &ReplayGuardSnapshot) -> Result<(), StateStoreError>;

    /// Append one line to the operator-action audit log.
    fn append_audit(&self, line: &str) -> Result<(), StateStoreError>;
}

/// In-memory state store for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    armed: Mutex<ArmedState>,
    breaker: Mutex<BreakerState>,
    replay: Mutex<ReplayGuardSnapshot>,
    audit: Mutex<Vec<String>>,
}

impl MemoryStateStore {
    /// Fresh store with default (closed) states.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit lines recorded so far.
    #[must_use]
    pub fn audit_lines(&self) -> Vec<String> {
        self.audit.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load_armed(&self) -> Result<ArmedState, StateStoreError> {
        Ok(*self.armed.lock())
    }

    fn store_armed(&self, state: ArmedState) -> Result<(), StateStoreError> {
        *self.armed.lock() = state;
        Ok(())
    }

    fn load_breaker(&self) -> Result<BreakerState, StateStoreError> {
        Ok(*self.breaker.lock())
    }

    fn store_breaker(&self, state: BreakerState) -> Result<(), StateStoreError> {
        *self.breaker.lock() = state;
        Ok(())
    }

    fn load_replay(&self) -> Result<ReplayGuardSnapshot, StateStoreError> {
        Ok(self.replay.lock().clone())
    }

    fn store_replay(&self, snapshot: &ReplayGuardSnapshot) -> Result<(), StateStoreError> {
        *self.replay.lock() = snapshot.clone();
        Ok(())
    }

    fn append_audit(&self, line: &str) -> Result<(), StateStoreError> {
        self.audit.lock().push(line.to_string());
        Ok(())
    }
}

/// Shared-secret lookup for envelope and operator MAC verification.
///
/// Returning `None` for an unknown issuer makes the MAC check fail closed:
/// no secret, no valid signature, `hmac_invalid`.
pub trait KeyProvider: Send + Sync {
    /// Secret for a brain issuer id.
    fn issuer_secret(&self, issuer: &str) -> Option<Vec<u8>>;

    /// Secret for the operator identity.
    fn operator_secret(&self) -> Vec<u8>;
}

/// Fixed key table, loaded from the credential vault at boot.
pub struct StaticKeyProvider {
    issuers: HashMap<String, Vec<u8>>,
    operator: Vec<u8>,
}

impl StaticKeyProvider {
    /// Build from explicit tables.
    #[must_use]
    pub fn new(issuers: HashMap<String, Vec<u8>>, operator: Vec<u8>) -> Self {
        Self { issuers, operator }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn issuer_secret(&self, issuer: &str) -> Option<Vec<u8>> {
        self.issuers.get(issuer).cloned()
    }

    fn operator_secret(&self) -> Vec<u8> {
        self.operator.clone()
    }
}

/// Time source, substitutable for deterministic tests.
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        shared_types::now_ms()
    }
}
