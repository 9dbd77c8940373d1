//! # Reflex Test Suite
//!
//! Unified test crate for cross-crate behavior:
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── end_to_end.rs   # Full organism flows over one bus
//!     └── wire_parity.rs  # Canonical JSON, hash parity, fencing bounds
//! ```
//!
//! Run with:
//!
//! ```bash
//! cargo test -p reflex-tests
//! ```

#![allow(dead_code)]

pub mod integration;
