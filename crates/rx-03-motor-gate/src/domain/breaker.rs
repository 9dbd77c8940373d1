//! The four-state circuit breaker.
//!
//! Escalation is monotonic: the automaton only ever moves toward EMERGENCY
//! on its own. De-escalation exists solely as an explicit operator action,
//! one level at a time. The service persists every transition and restores
//! the state on restart.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use shared_types::{BreakerState, BreakerThresholds};

/// Why the breaker moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerTrigger {
    DailyLossWarn,
    DailyLossHalt,
    DailyLossEmergency,
    ConsecutiveLosses(u32),
    ElevatedRejectRate(u32),
    PersistentDrift,
    OperatorHalt,
    OperatorDeescalate,
}

impl std::fmt::Display for BreakerTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerTrigger::DailyLossWarn => write!(f, "daily loss crossed warn threshold"),
            BreakerTrigger::DailyLossHalt => write!(f, "daily loss crossed halt threshold"),
            BreakerTrigger::DailyLossEmergency => {
                write!(f, "daily loss crossed emergency threshold")
            }
            BreakerTrigger::ConsecutiveLosses(n) => write!(f, "{n} consecutive losses"),
            BreakerTrigger::ElevatedRejectRate(n) => write!(f, "{n} rejects in the last minute"),
            BreakerTrigger::PersistentDrift => write!(f, "persistent shadow drift"),
            BreakerTrigger::OperatorHalt => write!(f, "operator halt"),
            BreakerTrigger::OperatorDeescalate => write!(f, "operator de-escalation"),
        }
    }
}

/// A transition that actually happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub trigger: BreakerTrigger,
}

const REJECT_WINDOW_MS: i64 = 60_000;

/// The breaker automaton. Not internally synchronized; the service owns it
/// behind its own lock.
pub struct CircuitBreaker {
    state: BreakerState,
    thresholds: BreakerThresholds,
    consecutive_losses: u32,
    reject_times: VecDeque<i64>,
}

impl CircuitBreaker {
    /// A breaker in NORMAL with the given thresholds.
    #[must_use]
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            state: BreakerState::Normal,
            thresholds,
            consecutive_losses: 0,
            reject_times: VecDeque::new(),
        }
    }

    /// Restore a persisted state (process restart).
    #[must_use]
    pub fn restored(thresholds: BreakerThresholds, state: BreakerState) -> Self {
        let mut breaker = Self::new(thresholds);
        breaker.state = state;
        breaker
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Monotonic escalation. Returns the transition if the state moved.
    fn escalate(&mut self, target: BreakerState, trigger: BreakerTrigger) -> Option<BreakerTransition> {
        if target <= self.state {
            return None;
        }
        let transition = BreakerTransition {
            from: self.state,
            to: target,
            trigger,
        };
        self.state = target;
        Some(transition)
    }

    /// Evaluate the day's realized PnL against the loss thresholds.
    pub fn evaluate_daily_pnl(&mut self, realized_pnl: Decimal) -> Option<BreakerTransition> {
        let loss = -realized_pnl;
        if loss >= self.thresholds.daily_loss_emergency {
            self.escalate(BreakerState::Emergency, BreakerTrigger::DailyLossEmergency)
        } else if loss >= self.thresholds.daily_loss_halt {
            self.escalate(BreakerState::Defensive, BreakerTrigger::DailyLossHalt)
        } else if loss >= self.thresholds.daily_loss_warn {
            self.escalate(BreakerState::Cautious, BreakerTrigger::DailyLossWarn)
        } else {
            None
        }
    }

    /// Record a closed trade's realized delta; a losing streak escalates.
    pub fn record_trade_result(&mut self, realized_delta: Decimal) -> Option<BreakerTransition> {
        if realized_delta < Decimal::ZERO {
            self.consecutive_losses += 1;
            if self.consecutive_losses >= self.thresholds.consecutive_losses {
                let count = self.consecutive_losses;
                return self.escalate(
                    BreakerState::Cautious,
                    BreakerTrigger::ConsecutiveLosses(count),
                );
            }
        } else {
            self.consecutive_losses = 0;
        }
        None
    }

    /// Record a rejection; an elevated rate over the last minute escalates.
    pub fn record_reject(&mut self, now_ms: i64) -> Option<BreakerTransition> {
        self.reject_times.push_back(now_ms);
        while let Some(&front) = self.reject_times.front() {
            if now_ms - front > REJECT_WINDOW_MS {
                self.reject_times.pop_front();
            } else {
                break;
            }
        }
        let count = self.reject_times.len() as u32;
        if count >= self.thresholds.reject_rate_per_min {
            self.escalate(BreakerState::Cautious, BreakerTrigger::ElevatedRejectRate(count))
        } else {
            None
        }
    }

    /// Persistent drift from the detector.
    pub fn drift_detected(&mut self) -> Option<BreakerTransition> {
        self.escalate(BreakerState::Defensive, BreakerTrigger::PersistentDrift)
    }

    /// Anomalous security-reject rate (HMAC failures, venue rejects). A
    /// stream of forged envelopes is an attack, not noise: block placement.
    pub fn security_anomaly(&mut self, rate: u32) -> Option<BreakerTransition> {
        self.escalate(
            BreakerState::Defensive,
            BreakerTrigger::ElevatedRejectRate(rate),
        )
    }

    /// Operator HALT.
    pub fn operator_halt(&mut self) -> Option<BreakerTransition> {
        self.escalate(BreakerState::Emergency, BreakerTrigger::OperatorHalt)
    }

    /// Operator de-escalation: exactly one level down.
    pub fn deescalate(&mut self) -> Option<BreakerTransition> {
        let target = self.state.deescalated();
        if target == self.state {
            return None;
        }
        let transition = BreakerTransition {
            from: self.state,
            to: target,
            trigger: BreakerTrigger::OperatorDeescalate,
        };
        self.state = target;
        self.consecutive_losses = 0;
        Some(transition)
    }
}
