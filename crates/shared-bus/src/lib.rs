//! # Shared Bus - Signed Subject-Addressed Streams
//!
//! The only communication channel between the Cortex and the Motor. Direct
//! calls between the two runtimes do not exist; each imports only
//! `shared-types` and this crate.
//!
//! ## Contract
//!
//! - Three persistent streams (`commands`, `events`, `data`), each an
//!   append-only sequence-numbered log with a retention horizon.
//! - Per-identity ACLs bind publish and subscribe rights to subject
//!   prefixes; an unauthorized publish is an error, not a silent drop.
//! - Delivery is at-least-once: late subscribers replay from their durable
//!   cursor, then continue live; duplicates across the seam are possible and
//!   every consumer must be idempotent.
//! - Subscribers hold a bounded prefetch window. When it is full the bus
//!   suspends delivery to that subscriber; nothing queues unboundedly.
//! - A transport disconnect is observable via [`MessageBus::connection`];
//!   leaders watching it demote immediately.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod acl;
pub mod cursor;
pub mod publisher;
pub mod stream;
pub mod subjects;
pub mod subscriber;

pub use acl::{AclMatrix, Identity};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use publisher::{BusError, BusPublisher, DeadLetter, MessageBus};
pub use stream::{Stream, StreamLog, StreamMessage};
pub use subscriber::Subscription;

/// Messages a subscriber may hold unacknowledged before the bus suspends
/// delivery to it.
pub const DEFAULT_PREFETCH: usize = 256;

/// Messages retained per stream for replay.
pub const DEFAULT_RETENTION: usize = 100_000;
