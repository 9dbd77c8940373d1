//! # Canonical Policy
//!
//! The risk parameter document every process loads at boot. Two processes
//! agree on risk limits if and only if their policy hashes are equal; the
//! hash is SHA-256 over the canonical JSON serialization (recursively sorted
//! keys, compact separators), so it is stable across runs and machines.

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Policy-related failures.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy file not readable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Policy file malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Policy invalid: {0}")]
    Invalid(String),
}

/// 32-byte policy digest, lowercase hex on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyHash(pub [u8; 32]);

impl PolicyHash {
    /// Render as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 64 hex chars.
    pub fn from_hex(s: &str) -> Result<Self, PolicyError> {
        let bytes = hex::decode(s)
            .map_err(|e| PolicyError::Invalid(format!("policy hash not hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PolicyError::Invalid("policy hash must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for PolicyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PolicyHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PolicyHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PolicyHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-symbol risk limits. Symbols absent from the policy are not tradable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolPolicy {
    /// Max order notional for this symbol.
    pub max_notional: Decimal,
    /// Max leverage for this symbol.
    pub max_leverage: u32,
    /// Reconciliation tolerance: |shadow - exchange| above this is drift.
    pub recon_tolerance: Decimal,
}

/// Circuit-breaker trigger thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerThresholds {
    /// Daily loss beyond this enters CAUTIOUS.
    pub daily_loss_warn: Decimal,
    /// Daily loss beyond this enters DEFENSIVE.
    pub daily_loss_halt: Decimal,
    /// Daily loss beyond this enters EMERGENCY.
    pub daily_loss_emergency: Decimal,
    /// Consecutive losing fills that enter CAUTIOUS.
    pub consecutive_losses: u32,
    /// Rejects per minute (any reason) that enter CAUTIOUS.
    pub reject_rate_per_min: u32,
    /// Per-order notional cap for emergency flatten orders.
    pub emergency_order_notional_cap: Decimal,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            daily_loss_warn: Decimal::new(500, 0),
            daily_loss_halt: Decimal::new(1_500, 0),
            daily_loss_emergency: Decimal::new(3_000, 0),
            consecutive_losses: 5,
            reject_rate_per_min: 30,
            emergency_order_notional_cap: Decimal::new(10_000, 0),
        }
    }
}

/// The complete, immutable-by-version risk policy.
///
/// `symbols` doubles as the whitelist: presence in the map is permission to
/// trade. A `BTreeMap` keeps the canonical serialization independent of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPolicy {
    /// Monotonic policy version, bumped on every edit.
    pub version: u32,
    /// Whitelisted symbols and their limits.
    pub symbols: BTreeMap<String, SymbolPolicy>,
    /// Per-account leverage ceiling, across all positions.
    pub max_account_leverage: u32,
    /// Per-strategy daily loss cap.
    pub strategy_daily_loss_cap: Decimal,
    /// Breaker trigger thresholds.
    pub breaker: BreakerThresholds,
    /// Orders per second per exchange; bucket burst equals this.
    pub orders_per_second: u32,
    /// Fallback reconciliation tolerance for symbols without their own.
    pub default_recon_tolerance: Decimal,
}

impl CanonicalPolicy {
    /// Load a policy file and validate it.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let bytes = std::fs::read(path)?;
        let policy: CanonicalPolicy = serde_json::from_slice(&bytes)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.symbols.is_empty() {
            return Err(PolicyError::Invalid("symbol whitelist is empty".to_string()));
        }
        if self.orders_per_second == 0 {
            return Err(PolicyError::Invalid("orders_per_second must be > 0".to_string()));
        }
        let b = &self.breaker;
        if !(b.daily_loss_warn < b.daily_loss_halt && b.daily_loss_halt < b.daily_loss_emergency) {
            return Err(PolicyError::Invalid(
                "breaker daily-loss thresholds must be strictly increasing".to_string(),
            ));
        }
        for (symbol, sp) in &self.symbols {
            if sp.max_notional <= Decimal::ZERO {
                return Err(PolicyError::Invalid(format!(
                    "{symbol}: max_notional must be positive"
                )));
            }
            if sp.max_leverage == 0 || sp.max_leverage > self.max_account_leverage {
                return Err(PolicyError::Invalid(format!(
                    "{symbol}: max_leverage must be in 1..={}",
                    self.max_account_leverage
                )));
            }
        }
        Ok(())
    }

    /// Deterministic digest over the canonical JSON form.
    #[must_use]
    pub fn hash(&self) -> PolicyHash {
        let canonical = crate::envelope::canonical_json(self)
            .expect("policy contains no non-serializable values");
        PolicyHash(shared_crypto::sha256(canonical.as_bytes()))
    }

    /// Limits for a symbol, if whitelisted.
    #[must_use]
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolPolicy> {
        self.symbols.get(symbol)
    }

    /// Reconciliation tolerance for a symbol (per-symbol, with the global
    /// default as fallback).
    #[must_use]
    pub fn recon_tolerance(&self, symbol: &str) -> Decimal {
        self.symbols
            .get(symbol)
            .map(|s| s.recon_tolerance)
            .unwrap_or(self.default_recon_tolerance)
    }
}
