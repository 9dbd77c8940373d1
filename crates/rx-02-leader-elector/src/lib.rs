//! # RX-02 Leader Elector
//!
//! Elects exactly one active brain across replicas, over the bus lease
//! subject. No coordination service: candidates publish heartbeats, and the
//! protocol's total order on claims decides the winner.
//!
//! ## Fencing
//!
//! Every promotion increments a persistent monotonic `leader_term`. The term
//! rides on every intent; the Motor rejects terms older than the latest it
//! has observed per issuer, so a deposed leader's in-flight intents fence
//! themselves out the moment a successor is accepted. Split-brain cannot
//! place two accepted intents.
//!
//! ## Liveness rules
//!
//! - Leaders heartbeat every `LEASE_MS / 3`; a lease is dead after
//!   `LEASE_MS` without one.
//! - A claim with a higher term wins; equal terms tie-break toward the
//!   lexicographically smaller candidate id.
//! - Bus disconnect is an immediate hard demotion, not a grace period.

pub mod domain;
pub mod ports;
pub mod service;

pub use domain::{LeaseHeartbeat, LeaseMachine, Leadership, TickAction};
pub use ports::{FileTermStore, MemoryTermStore, SystemTimeSource, TermStore, TimeSource};
pub use service::{ElectorError, ElectorHandle, LeaderElector};
