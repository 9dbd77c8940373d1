//! # RX-05 Signal Gate
//!
//! The Cortex-side approval surface between strategy signals and the Motor.
//! It never places an order; its only output is signed intent envelopes on
//! the commands stream, and only while this replica holds the leader lease
//! and the policy handshake is green.
//!
//! ## Flow per signal
//!
//! 1. Leader check - followers drop signals silently (the leader sees them
//!    too; processing twice would double-trade).
//! 2. Policy handshake check - until the Motor has advertised a policy hash
//!    equal to ours, nothing is emitted.
//! 3. Durable dedup by strategy-supplied `signal_id` (TTL at least the
//!    strategy retry window).
//! 4. Approval chain: symbol allowed, strategy active, exposure permits,
//!    flow validator permits, regime permits. First refusal wins.
//! 5. Envelope construction: fresh intent id, persistent monotonic nonce,
//!    current fencing term, HMAC over the canonical preimage.

pub mod approval;
pub mod dedup;
pub mod service;

pub use approval::{
    ApprovalChain, ApprovalPorts, FlowValidator, OpenPorts, RegimeGate, StrategyRegistry,
};
pub use dedup::{DedupStore, FileDedupStore, MemoryDedupStore};
pub use service::{GateError, SignalGate, SignalGateDependencies, SignalOutcome};
