//! Core domain entities shared by Motor and Cortex.
//!
//! Everything here is a closed enum or a plain struct with snake_case wire
//! tags. Tagged variants arriving off the bus deserialize into these types and
//! are exhaustively matched; there is no dynamic per-envelope typing anywhere
//! in the system.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::PolicyHash;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Sign applied to position size: buys add, sells subtract.
    #[must_use]
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    /// The side that closes a position of the given size.
    #[must_use]
    pub fn closing(size: Decimal) -> Side {
        if size.is_sign_positive() {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    PostOnly,
    Ioc,
}

impl OrderType {
    /// Whether this order type requires a limit price.
    #[must_use]
    pub fn requires_limit_price(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

/// The order request inside an intent envelope.
///
/// Quantities and prices are decimal strings on the wire; `Decimal` in
/// memory. The payload carries no issuer identity - identity lives only in
/// the envelope header, which is the sole authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPayload {
    /// Opaque unique identifier (128-bit).
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
    pub client_order_tag: String,
}

impl IntentPayload {
    /// Notional value at the given reference price.
    #[must_use]
    pub fn notional_at(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }
}

/// Why an intent was refused. One reason per rejection; the pipeline
/// short-circuits on the first failing gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SystemDisarmed,
    Malformed,
    TimestampSkew,
    HmacInvalid,
    NonceReplay,
    PolicyHashMismatch,
    CircuitOpen,
    RateLimited,
    UnknownSymbol,
    RiskExceeded,
    ExchangeRejected,
}

impl RejectReason {
    /// Transient reasons are retryable from the issuer side; all others are
    /// terminal for that intent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RejectReason::RateLimited)
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::SystemDisarmed => "system_disarmed",
            RejectReason::Malformed => "malformed",
            RejectReason::TimestampSkew => "timestamp_skew",
            RejectReason::HmacInvalid => "hmac_invalid",
            RejectReason::NonceReplay => "nonce_replay",
            RejectReason::PolicyHashMismatch => "policy_hash_mismatch",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::UnknownSymbol => "unknown_symbol",
            RejectReason::RiskExceeded => "risk_exceeded",
            RejectReason::ExchangeRejected => "exchange_rejected",
        };
        write!(f, "{s}")
    }
}

/// Emitted whenever an intent is refused, on the reject subject.
///
/// `intent_id` is present whenever it could be extracted, even from envelopes
/// that failed integrity, so audit correlation survives hostile input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    pub reason: RejectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_policy_hash: Option<PolicyHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_policy_hash: Option<PolicyHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain_instance_id: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

/// Emitted when an intent clears the full pipeline and the exchange accepts
/// the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedEvent {
    pub intent_id: Uuid,
    pub order_id: String,
    pub symbol: String,
    pub timestamp: i64,
}

/// An exchange fill, emitted by the Motor for every fill received.
///
/// `fill_id` is the exchange-provided globally unique id; every consumer
/// absorbs repeats idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub intent_id: Uuid,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub filled_qty: Decimal,
    pub fill_price: Decimal,
    pub fees: Decimal,
    /// Milliseconds since epoch.
    pub filled_at: i64,
}

impl FillEvent {
    /// Gross notional of this fill.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.filled_qty * self.fill_price
    }
}

/// Arm/disarm interlock. Defaults closed; every transition is persisted
/// before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmedState {
    #[default]
    Disarmed,
    Armed,
    Halted,
}

impl ArmedState {
    /// Only `Armed` lets the pipeline proceed past step one.
    #[must_use]
    pub fn allows_placement(&self) -> bool {
        matches!(self, ArmedState::Armed)
    }
}

impl std::fmt::Display for ArmedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArmedState::Disarmed => write!(f, "disarmed"),
            ArmedState::Armed => write!(f, "armed"),
            ArmedState::Halted => write!(f, "halted"),
        }
    }
}

/// Circuit-breaker state. Escalation is monotonic; de-escalation only via an
/// explicit operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Normal,
    Cautious,
    Defensive,
    Emergency,
}

impl BreakerState {
    /// Whether new orders may be placed in this state.
    #[must_use]
    pub fn allows_new_orders(&self) -> bool {
        matches!(self, BreakerState::Normal | BreakerState::Cautious)
    }

    /// Sizing multiplier applied to risk caps in this state.
    #[must_use]
    pub fn size_multiplier(&self) -> Decimal {
        match self {
            BreakerState::Normal => Decimal::ONE,
            BreakerState::Cautious => Decimal::new(5, 1), // 0.5
            BreakerState::Defensive | BreakerState::Emergency => Decimal::ZERO,
        }
    }

    /// One level down, for operator de-escalation.
    #[must_use]
    pub fn deescalated(&self) -> BreakerState {
        match self {
            BreakerState::Emergency => BreakerState::Defensive,
            BreakerState::Defensive => BreakerState::Cautious,
            BreakerState::Cautious | BreakerState::Normal => BreakerState::Normal,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Normal => write!(f, "normal"),
            BreakerState::Cautious => write!(f, "cautious"),
            BreakerState::Defensive => write!(f, "defensive"),
            BreakerState::Emergency => write!(f, "emergency"),
        }
    }
}

/// Which guarded state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeKind {
    Armed,
    Breaker,
}

/// Emitted on every arm/disarm/halt and breaker transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub kind: StateChangeKind,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub timestamp: i64,
}

/// Drift between shadow state and exchange truth, reported by the
/// reconciler with both values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    pub account: String,
    pub symbol: String,
    pub shadow_size: Decimal,
    pub exchange_size: Decimal,
    pub tolerance: Decimal,
    pub timestamp: i64,
}

impl DriftEvent {
    /// Signed magnitude of the divergence.
    #[must_use]
    pub fn magnitude(&self) -> Decimal {
        (self.shadow_size - self.exchange_size).abs()
    }
}

/// Motor-side policy advertisement. A newly promoted leader refuses to emit
/// intents until it has seen one of these carrying its own hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAdvertisedEvent {
    pub policy_hash: PolicyHash,
    pub policy_version: u32,
    /// Identity of the advertising process.
    pub identity: String,
    pub timestamp: i64,
}

/// A strategy signal arriving on a signal subject. Strategy engines are
/// black boxes; only this surface is contracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Strategy-supplied dedup key.
    pub signal_id: String,
    pub strategy_id: String,
    pub phase: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
    pub issued_at: i64,
}

/// Operator actions accepted over the command subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Arm,
    Disarm,
    Halt,
    BreakerDeescalate,
}

impl std::fmt::Display for OperatorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperatorAction::Arm => "arm",
            OperatorAction::Disarm => "disarm",
            OperatorAction::Halt => "halt",
            OperatorAction::BreakerDeescalate => "breaker_deescalate",
        };
        write!(f, "{s}")
    }
}

/// A signed operator command. The MAC preimage is
/// `timestamp:action:actor_id:command_id` under the operator secret, a
/// separate identity from the brain issuers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub command_id: Uuid,
    pub action: OperatorAction,
    pub actor_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// HMAC-SHA256 over the preimage, lowercase hex.
    pub signature: String,
}

impl OperatorCommand {
    /// The exact byte string the operator MAC covers.
    #[must_use]
    pub fn preimage(timestamp: i64, action: OperatorAction, actor_id: &str, command_id: Uuid) -> String {
        format!("{timestamp}:{action}:{actor_id}:{command_id}")
    }

    /// Construct and sign a command with the operator secret.
    #[must_use]
    pub fn signed(action: OperatorAction, actor_id: &str, timestamp: i64, secret: &[u8]) -> Self {
        let command_id = Uuid::new_v4();
        let preimage = Self::preimage(timestamp, action, actor_id, command_id);
        let signature = hex::encode(crate::security::sign_bytes(preimage.as_bytes(), secret));
        Self {
            command_id,
            action,
            actor_id: actor_id.to_string(),
            timestamp,
            signature,
        }
    }

    /// Verify the MAC against the operator secret.
    #[must_use]
    pub fn verify(&self, secret: &[u8]) -> bool {
        let preimage = Self::preimage(self.timestamp, self.action, &self.actor_id, self.command_id);
        let Ok(sig) = hex::decode(&self.signature) else {
            return false;
        };
        crate::security::verify_bytes(preimage.as_bytes(), &sig, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_sign_and_closing() {
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), -Decimal::ONE);
        assert_eq!(Side::closing(dec!(2.5)), Side::Sell);
        assert_eq!(Side::closing(dec!(-1)), Side::Buy);
    }

    #[test]
    fn test_reject_reason_wire_tags() {
        let json = serde_json::to_string(&RejectReason::SystemDisarmed).unwrap();
        assert_eq!(json, "\"system_disarmed\"");
        let json = serde_json::to_string(&RejectReason::PolicyHashMismatch).unwrap();
        assert_eq!(json, "\"policy_hash_mismatch\"");
    }

    #[test]
    fn test_reject_reason_transience() {
        assert!(RejectReason::RateLimited.is_transient());
        assert!(!RejectReason::SystemDisarmed.is_transient());
        assert!(!RejectReason::ExchangeRejected.is_transient());
    }

    #[test]
    fn test_armed_state_defaults_closed() {
        assert_eq!(ArmedState::default(), ArmedState::Disarmed);
        assert!(!ArmedState::default().allows_placement());
        assert!(ArmedState::Armed.allows_placement());
        assert!(!ArmedState::Halted.allows_placement());
    }

    #[test]
    fn test_breaker_permissions_and_multipliers() {
        assert!(BreakerState::Normal.allows_new_orders());
        assert!(BreakerState::Cautious.allows_new_orders());
        assert!(!BreakerState::Defensive.allows_new_orders());
        assert!(!BreakerState::Emergency.allows_new_orders());

        assert_eq!(BreakerState::Normal.size_multiplier(), Decimal::ONE);
        assert_eq!(BreakerState::Cautious.size_multiplier(), dec!(0.5));
        assert_eq!(BreakerState::Emergency.size_multiplier(), Decimal::ZERO);
    }

    #[test]
    fn test_breaker_ordering_is_escalation_order() {
        assert!(BreakerState::Normal < BreakerState::Cautious);
        assert!(BreakerState::Cautious < BreakerState::Defensive);
        assert!(BreakerState::Defensive < BreakerState::Emergency);
        assert_eq!(BreakerState::Emergency.deescalated(), BreakerState::Defensive);
        assert_eq!(BreakerState::Normal.deescalated(), BreakerState::Normal);
    }

    #[test]
    fn test_decimal_fields_serialize_as_strings() {
        let fill = FillEvent {
            fill_id: "F-1".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            filled_qty: dec!(0.25),
            fill_price: dec!(64250.10),
            fees: dec!(1.2),
            filled_at: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&fill).unwrap();
        assert_eq!(json["filled_qty"], "0.25");
        assert_eq!(json["fill_price"], "64250.10");
    }

    #[test]
    fn test_operator_command_sign_verify() {
        let secret = b"operator-secret";
        let cmd = OperatorCommand::signed(OperatorAction::Halt, "ops-1", 1_700_000_000_000, secret);
        assert!(cmd.verify(secret));
        assert!(!cmd.verify(b"wrong-secret"));

        let mut tampered = cmd.clone();
        tampered.actor_id = "mallory".to_string();
        assert!(!tampered.verify(secret));
    }

    #[test]
    fn test_operator_preimage_format() {
        let id = Uuid::nil();
        let pre = OperatorCommand::preimage(42, OperatorAction::Arm, "ops-1", id);
        assert_eq!(pre, format!("42:arm:ops-1:{id}"));
    }
}
