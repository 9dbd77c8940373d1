//! # Shared Types - Reflex Domain Model
//!
//! The single schema crate shared by the Motor and the Cortex. Neither
//! runtime imports the other; both import only this crate and the bus, which
//! is what breaks the Brain <-> Execution cycle.
//!
//! ## Contents
//!
//! | Module | Contents |
//! |--------|----------|
//! | `entities` | Orders, fills, rejections, armed/breaker states, operator commands |
//! | `envelope` | The signed `IntentEnvelope` wire contract and canonical JSON |
//! | `policy` | `CanonicalPolicy` risk document and its deterministic hash |
//! | `security` | HMAC sign/verify and the per-issuer replay/fencing guard |
//! | `rate_limiter` | Deterministic token bucket, keyed per exchange |
//!
//! ## Wire discipline
//!
//! - Closed enums in memory, snake_case tags on the wire.
//! - Money and quantity fields are `Decimal`, serialized as decimal strings.
//! - Canonical JSON means recursively sorted keys and compact separators;
//!   hashes and MACs are computed over that form only.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod entities;
pub mod envelope;
pub mod policy;
pub mod rate_limiter;
pub mod security;

pub use entities::{
    AcceptedEvent, ArmedState, BreakerState, DriftEvent, FillEvent, IntentPayload, OperatorAction,
    OperatorCommand, OrderType, PolicyAdvertisedEvent, RejectReason, RejectionEvent, SignalEvent,
    StateChangeEvent, StateChangeKind, Side,
};
pub use envelope::{canonical_json, EnvelopeError, IntentEnvelope};
pub use policy::{BreakerThresholds, CanonicalPolicy, PolicyError, PolicyHash, SymbolPolicy};
pub use rate_limiter::{BucketRegistry, TokenBucket};
pub use security::{sign_bytes, verify_bytes, ReplayError, ReplayGuard, ReplayGuardSnapshot};

/// Accepted clock skew for intent timestamps, inclusive (milliseconds).
pub const TIMESTAMP_WINDOW_MS: i64 = 300_000;

/// Retention horizon for per-issuer nonce history (milliseconds).
pub const NONCE_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Leader lease duration (milliseconds). Heartbeats renew at a third of this.
pub const LEASE_MS: u64 = 10_000;

/// Per-call deadline for exchange requests (milliseconds).
pub const EXCHANGE_DEADLINE_MS: u64 = 2_000;

/// Deadline for a reconciliation pull (milliseconds).
pub const RECONCILE_DEADLINE_MS: u64 = 5_000;

/// Deadline for a ledger transaction commit (milliseconds).
pub const LEDGER_DEADLINE_MS: u64 = 1_000;

/// Interval between reconciliation passes (milliseconds).
pub const RECONCILE_INTERVAL_MS: u64 = 60_000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
