//! # RX-04 Shadow State
//!
//! The Motor's local belief about each (account, symbol) position, and the
//! reconciler that keeps that belief honest.
//!
//! ## Update sources
//!
//! 1. Order acknowledged by the exchange (pending exposure).
//! 2. Fill received from the exchange (position math).
//! 3. Reconciliation pull (exchange value replaces shadow value).
//!
//! Every update bumps the position's `version_counter`. Updates are
//! serialized per symbol behind per-symbol async locks; across symbols they
//! run in parallel.
//!
//! ## Truth model
//!
//! The exchange is canonical. When |shadow - exchange| exceeds the
//! per-symbol tolerance the reconciler emits a drift event carrying both
//! values, then overwrites the shadow with the exchange value. The replace
//! is atomic from the pipeline's perspective (it happens under the symbol
//! lock).

pub mod book;
pub mod domain;
pub mod ports;
pub mod reconciler;

pub use book::ShadowBook;
pub use domain::{ShadowError, ShadowPosition};
pub use ports::{ExchangePosition, PositionReader, DriftSink};
pub use reconciler::{ReconcileError, Reconciler};
