//! # Envelope Security
//!
//! HMAC-SHA256 signing plus the per-issuer replay guard: nonce high-water
//! marks with a bounded history, and leader-term fencing.
//!
//! ## Verification Ordering
//!
//! The pipeline checks timestamp, MAC, nonce, then term, in that order; the
//! guard here only implements the nonce and term steps. Nonce state mutates
//! on check, so callers must verify the MAC first or an attacker could burn
//! legitimate nonces with forged envelopes.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use hmac::{Hmac, Mac};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Max issuers tracked before the oldest is evicted.
const MAX_ISSUERS: usize = 256;

/// Per-issuer nonce history size. History exists for audit lookups; the
/// high-water mark alone is what rejects replays.
const NONCE_HISTORY: usize = 4096;

/// Replay/fencing rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// The nonce is not strictly greater than the issuer's high-water mark.
    #[error("Nonce {nonce} already consumed by issuer {issuer} (high-water {high_water})")]
    NonceReplayed {
        issuer: String,
        nonce: u64,
        high_water: u64,
    },

    /// The leader term is older than one already observed from this issuer.
    #[error("Term {term} from issuer {issuer} fenced out (latest {latest})")]
    TermFenced {
        issuer: String,
        term: u64,
        latest: u64,
    },
}

/// Sign a byte string with HMAC-SHA256.
#[must_use]
pub fn sign_bytes(message: &[u8], secret: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 tag in constant time.
#[must_use]
pub fn verify_bytes(message: &[u8], signature: &[u8], secret: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    // Constant-time comparison.
    mac.verify_slice(signature).is_ok()
}

/// Tracking state for one issuer.
struct IssuerState {
    /// Highest accepted nonce. Strictly-greater acceptance gives both replay
    /// rejection and per-issuer nonce-order processing.
    high_water: u64,
    /// Recent accepted nonces with their issue timestamps, for audit.
    history: LruCache<u64, i64>,
    /// Latest observed leader term. Equal terms are accepted.
    last_term: u64,
}

impl IssuerState {
    fn new() -> Self {
        Self {
            high_water: 0,
            history: LruCache::new(NonZeroUsize::new(NONCE_HISTORY).expect("nonzero")),
            last_term: 0,
        }
    }
}

/// Durable snapshot of the guard's essential state. The nonce history is
/// in-memory only; high-water marks and terms are what must survive a
/// restart to keep the replay invariant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayGuardSnapshot {
    /// issuer -> (nonce high-water, latest term)
    pub issuers: HashMap<String, (u64, u64)>,
}

/// Per-issuer replay and fencing guard.
///
/// Not internally synchronized; the Motor pipeline owns one behind its own
/// lock so nonce checks serialize with the rest of intent processing.
pub struct ReplayGuard {
    issuers: LruCache<String, IssuerState>,
    retention_ms: i64,
}

impl ReplayGuard {
    /// Create a guard with the default 24 h nonce retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(crate::NONCE_RETENTION_MS)
    }

    /// Create a guard with custom retention (test hook).
    #[must_use]
    pub fn with_retention(retention_ms: i64) -> Self {
        Self {
            issuers: LruCache::new(NonZeroUsize::new(MAX_ISSUERS).expect("nonzero")),
            retention_ms,
        }
    }

    /// Check-and-consume a nonce for an issuer.
    ///
    /// Accepts only nonces strictly greater than the issuer's high-water
    /// mark: a value equal to the last seen is a replay, and an older value
    /// is out-of-order delivery of something already superseded. Both reject.
    pub fn check_nonce(&mut self, issuer: &str, nonce: u64, issued_at: i64) -> Result<(), ReplayError> {
        let state = self.issuer_mut(issuer);
        if nonce <= state.high_water && state.high_water != 0 {
            return Err(ReplayError::NonceReplayed {
                issuer: issuer.to_string(),
                nonce,
                high_water: state.high_water,
            });
        }
        if nonce == 0 && state.high_water == 0 && state.history.contains(&0) {
            // First-ever nonce may be zero, but only once.
            return Err(ReplayError::NonceReplayed {
                issuer: issuer.to_string(),
                nonce,
                high_water: 0,
            });
        }
        state.high_water = state.high_water.max(nonce);
        state.history.put(nonce, issued_at);
        self.prune(issuer, issued_at);
        Ok(())
    }

    /// Check-and-observe a leader term for an issuer.
    ///
    /// Terms equal to the latest observed are accepted (same leader); older
    /// terms are fenced out.
    pub fn check_term(&mut self, issuer: &str, term: u64) -> Result<(), ReplayError> {
        let state = self.issuer_mut(issuer);
        if term < state.last_term {
            return Err(ReplayError::TermFenced {
                issuer: issuer.to_string(),
                term,
                latest: state.last_term,
            });
        }
        state.last_term = term;
        Ok(())
    }

    /// Latest term observed from an issuer (0 if never seen).
    #[must_use]
    pub fn last_term(&mut self, issuer: &str) -> u64 {
        self.issuers.get(issuer).map(|s| s.last_term).unwrap_or(0)
    }

    /// Export the durable portion for snapshotting.
    #[must_use]
    pub fn snapshot(&self) -> ReplayGuardSnapshot {
        let issuers = self
            .issuers
            .iter()
            .map(|(k, v)| (k.clone(), (v.high_water, v.last_term)))
            .collect();
        ReplayGuardSnapshot { issuers }
    }

    /// Restore high-water marks and terms from a snapshot.
    pub fn restore(&mut self, snapshot: ReplayGuardSnapshot) {
        for (issuer, (high_water, last_term)) in snapshot.issuers {
            let state = self.issuer_mut(&issuer);
            state.high_water = state.high_water.max(high_water);
            state.last_term = state.last_term.max(last_term);
        }
    }

    fn issuer_mut(&mut self, issuer: &str) -> &mut IssuerState {
        if !self.issuers.contains(issuer) {
            self.issuers.put(issuer.to_string(), IssuerState::new());
        }
        self.issuers.get_mut(issuer).expect("just inserted")
    }

    /// Drop history entries older than the retention horizon. The high-water
    /// mark is never dropped.
    fn prune(&mut self, issuer: &str, now_ms: i64) {
        let retention = self.retention_ms;
        if let Some(state) = self.issuers.get_mut(issuer) {
            let expired: Vec<u64> = state
                .history
                .iter()
                .filter(|(_, &ts)| now_ms.saturating_sub(ts) > retention)
                .map(|(&n, _)| n)
                .collect();
            for nonce in expired {
                state.history.pop(&nonce);
            }
        }
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}
