//! # RX-03 Motor Gate
//!
//! The component that exclusively owns the order-placement side effect.
//! Everything between bus receipt and exchange submission lives here: the
//! ordered validation pipeline, the armed interlock, the circuit breaker,
//! the drift detector, the risk guard, and operator command handling.
//!
//! ## Pipeline ordering (load-bearing)
//!
//! | # | Gate | Rejection |
//! |---|------|-----------|
//! | 1 | Armed interlock (before any parse beyond the intent id) | `system_disarmed` |
//! | 2 | Envelope parse & schema | `malformed` |
//! | 3 | Timestamp skew (±300 s inclusive) | `timestamp_skew` |
//! | 4 | HMAC verify (constant time) | `hmac_invalid` |
//! | 5 | Nonce replay (per-issuer monotonic) | `nonce_replay` |
//! | 6 | Term monotonicity (fencing) | `nonce_replay` |
//! | 7 | Policy hash parity | `policy_hash_mismatch` |
//! | 8 | Circuit breaker permission | `circuit_open` |
//! | 9 | Symbol & leverage whitelist | `unknown_symbol` / `risk_exceeded` |
//! | 10 | Rate limiter | `rate_limited` |
//! | 11 | Risk guard (caps scaled by breaker multiplier) | `risk_exceeded` |
//! | 12 | Exchange submit (retry transient, 3x, <= 1 s) | `exchange_rejected` |
//!
//! The chain short-circuits on the first failure and emits exactly one
//! rejection event with the precise reason. Cheapest, most dangerous checks
//! run first: a fuzzed payload against a disarmed Motor produces
//! `system_disarmed` and nothing else - no parse, no forensic detail.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use domain::{
    ArmedInterlock, BreakerTrigger, CircuitBreaker, DriftClass, DriftDetector, MotorError,
    RiskGuard, RiskInputs,
};
pub use ports::{
    EventSink, ExchangeError, ExchangeGateway, KeyProvider, MemoryStateStore, OrderAck,
    OrderRequest, StateStore, StateStoreError, StaticKeyProvider, SystemTimeSource, TimeSource,
};
pub use service::{MotorConfig, MotorDependencies, MotorService, PipelineOutcome};
