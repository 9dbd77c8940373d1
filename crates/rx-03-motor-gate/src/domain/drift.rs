//! Drift classification and anomaly rate tracking.
//!
//! The reconciler reports raw divergences; this module decides which of
//! them matter. A single small divergence is noise (venue-side rounding, a
//! fill racing the pull); the same direction twice running, or one large
//! jump, is a real disagreement and the breaker must react.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use shared_types::DriftEvent;

/// How a drift observation is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftClass {
    /// Single observation, small magnitude. Logged, not escalated.
    Transient,
    /// Repeated same-direction divergence, or magnitude beyond the soft
    /// threshold. Escalates the breaker to DEFENSIVE.
    Persistent,
}

/// Magnitude multiplier over the per-symbol tolerance that makes a single
/// observation persistent on its own.
const SOFT_THRESHOLD_MULT: i64 = 10;

/// Consecutive same-direction observations that make drift persistent.
const PERSISTENT_REPEATS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ShadowHigh,
    ShadowLow,
}

struct SymbolDrift {
    direction: Direction,
    repeats: u32,
}

/// Rolling event-per-minute counter.
struct RateWindow {
    window_ms: i64,
    threshold: u32,
    times: VecDeque<i64>,
}

impl RateWindow {
    fn new(window_ms: i64, threshold: u32) -> Self {
        Self {
            window_ms,
            threshold,
            times: VecDeque::new(),
        }
    }

    /// Record an event; returns true when the rate crosses the threshold.
    fn record(&mut self, now_ms: i64) -> bool {
        self.times.push_back(now_ms);
        while let Some(&front) = self.times.front() {
            if now_ms - front > self.window_ms {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.len() as u32 >= self.threshold
    }
}

/// Classifies drift and tracks the anomaly rates that feed the breaker:
/// HMAC rejects, exchange rejects, reconnects.
pub struct DriftDetector {
    per_symbol: HashMap<String, SymbolDrift>,
    hmac_rejects: RateWindow,
    exchange_rejects: RateWindow,
    reconnects: RateWindow,
}

impl DriftDetector {
    /// Detector with default thresholds: 10 HMAC rejects/min, 20 exchange
    /// rejects/min, 5 reconnects/min.
    #[must_use]
    pub fn new() -> Self {
        Self {
            per_symbol: HashMap::new(),
            hmac_rejects: RateWindow::new(60_000, 10),
            exchange_rejects: RateWindow::new(60_000, 20),
            reconnects: RateWindow::new(60_000, 5),
        }
    }

    /// Classify one drift observation.
    pub fn classify(&mut self, event: &DriftEvent) -> DriftClass {
        let magnitude = event.magnitude();
        let soft_threshold = event.tolerance * Decimal::from(SOFT_THRESHOLD_MULT);
        if magnitude >= soft_threshold {
            self.per_symbol.remove(&event.symbol);
            return DriftClass::Persistent;
        }

        let direction = if event.shadow_size > event.exchange_size {
            Direction::ShadowHigh
        } else {
            Direction::ShadowLow
        };

        let entry = self
            .per_symbol
            .entry(event.symbol.clone())
            .or_insert(SymbolDrift {
                direction,
                repeats: 0,
            });
        if entry.direction == direction {
            entry.repeats += 1;
        } else {
            entry.direction = direction;
            entry.repeats = 1;
        }

        if entry.repeats >= PERSISTENT_REPEATS {
            self.per_symbol.remove(&event.symbol);
            DriftClass::Persistent
        } else {
            DriftClass::Transient
        }
    }

    /// A clean reconciliation pass for a symbol clears its streak.
    pub fn observe_clean(&mut self, symbol: &str) {
        self.per_symbol.remove(symbol);
    }

    /// Record an HMAC rejection; true when the rate is anomalous.
    pub fn record_hmac_reject(&mut self, now_ms: i64) -> bool {
        self.hmac_rejects.record(now_ms)
    }

    /// Record an exchange rejection; true when the rate is anomalous.
    pub fn record_exchange_reject(&mut self, now_ms: i64) -> bool {
        self.exchange_rejects.record(now_ms)
    }

    /// Record a bus reconnect; true when the rate is anomalous.
    pub fn record_reconnect(&mut self, now_ms: i64) -> bool {
        self.reconnects.record(now_ms)
    }
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new()
    }
}
