//! Motor service tests: pipeline ordering, fencing, breaker, flatten.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use rx_04_shadow_state::ShadowBook;
use shared_types::{
    ArmedState, BreakerState, BreakerThresholds, CanonicalPolicy, DriftEvent, FillEvent,
    IntentEnvelope, IntentPayload, OperatorAction, OperatorCommand, OrderType, RejectReason, Side,
    SymbolPolicy,
};

use crate::adapters::{PaperExchange, RecordingSink};
use crate::ports::{ExchangeError, MemoryStateStore, StaticKeyProvider, StateStore, TimeSource};
use crate::service::{MotorConfig, MotorDependencies, MotorService};

const BRAIN_SECRET: &[u8] = b"brain-shared-secret";
const OPERATOR_SECRET: &[u8] = b"operator-shared-secret";
const T0: i64 = 1_700_000_000_000;

struct MockTime(AtomicI64);

impl MockTime {
    fn shared(start: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start)))
    }

    fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for MockTime {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn policy() -> CanonicalPolicy {
    let mut symbols = std::collections::BTreeMap::new();
    symbols.insert(
        "BTCUSDT".to_string(),
        SymbolPolicy {
            max_notional: dec!(100000),
            max_leverage: 5,
            recon_tolerance: dec!(0.001),
        },
    );
    CanonicalPolicy {
        version: 1,
        symbols,
        max_account_leverage: 10,
        strategy_daily_loss_cap: dec!(1000),
        breaker: BreakerThresholds {
            daily_loss_warn: dec!(500),
            daily_loss_halt: dec!(1500),
            daily_loss_emergency: dec!(3000),
            consecutive_losses: 3,
            reject_rate_per_min: 1000,
            emergency_order_notional_cap: dec!(100000),
        },
        orders_per_second: 10,
        default_recon_tolerance: dec!(0.001),
    }
}

struct Fixture {
    motor: MotorService<PaperExchange, RecordingSink, StaticKeyProvider>,
    venue: Arc<PaperExchange>,
    sink: Arc<RecordingSink>,
    time: Arc<MockTime>,
    store: Arc<MemoryStateStore>,
}

fn fixture() -> Fixture {
    fixture_with(PaperExchange::auto_filling(dec!(1000000)))
}

fn fixture_with(venue: PaperExchange) -> Fixture {
    venue.set_mark("BTCUSDT", dec!(100));
    let venue = Arc::new(venue);
    let sink = Arc::new(RecordingSink::new());
    let time = MockTime::shared(T0);
    let store = Arc::new(MemoryStateStore::new());
    let mut issuers = HashMap::new();
    issuers.insert("brain-a".to_string(), BRAIN_SECRET.to_vec());
    issuers.insert("brain-b".to_string(), BRAIN_SECRET.to_vec());

    let motor = MotorService::new(MotorDependencies {
        config: MotorConfig {
            account: "main".to_string(),
            exchange: "paper".to_string(),
            identity: "motor".to_string(),
        },
        policy: Arc::new(policy()),
        exchange: Arc::clone(&venue),
        sink: Arc::clone(&sink),
        keys: StaticKeyProvider::new(issuers, OPERATOR_SECRET.to_vec()),
        state_store: Arc::clone(&store) as Arc<dyn StateStore>,
        time: Arc::clone(&time) as Arc<dyn crate::ports::TimeSource>,
        book: Arc::new(ShadowBook::new("main")),
    })
    .unwrap();

    Fixture {
        motor,
        venue,
        sink,
        time,
        store,
    }
}

fn payload(intent_id: Uuid) -> IntentPayload {
    IntentPayload {
        intent_id,
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: dec!(1),
        limit_price: Some(dec!(100)),
        stop_loss: None,
        take_profit: None,
        leverage: 2,
        client_order_tag: "test".to_string(),
    }
}

fn signed_envelope(fix: &Fixture, nonce: u64, term: u64) -> Vec<u8> {
    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        fix.motor.policy_hash(),
        "brain-a".to_string(),
        term,
        fix.time.now_ms(),
        nonce,
        BRAIN_SECRET,
    )
    .unwrap();
    serde_json::to_vec(&envelope).unwrap()
}

async fn arm(fix: &Fixture) {
    let cmd = OperatorCommand::signed(OperatorAction::Arm, "ops-1", fix.time.now_ms(), OPERATOR_SECRET);
    fix.motor.handle_operator_command(&cmd).await.unwrap();
    assert_eq!(fix.motor.armed_state(), ArmedState::Armed);
}

// =============================================================================
// INTERLOCK PRECEDENCE
// =============================================================================

#[tokio::test]
async fn test_disarmed_rejects_before_anything_else() {
    let fix = fixture();
    let raw = signed_envelope(&fix, 1, 1);
    let outcome = fix.motor.process_raw_intent(&raw).await;

    assert_eq!(outcome.reject_reason(), Some(RejectReason::SystemDisarmed));
    assert_eq!(fix.venue.attempts(), 0);
    // Exactly one event, on the reject side, with the intent id extracted.
    let rejections = fix.sink.rejections.lock();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].intent_id.is_some());
}

#[tokio::test]
async fn test_policy_mismatch_masked_by_disarm() {
    let fix = fixture();
    // Wrong policy hash AND disarmed: the interlock wins.
    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        shared_types::PolicyHash([9u8; 32]),
        "brain-a".to_string(),
        1,
        fix.time.now_ms(),
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let raw = serde_json::to_vec(&envelope).unwrap();

    let outcome = fix.motor.process_raw_intent(&raw).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::SystemDisarmed));
}

#[tokio::test]
async fn test_garbage_while_disarmed_is_still_system_disarmed() {
    let fix = fixture();
    let outcome = fix.motor.process_raw_intent(b"\xff not even json").await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::SystemDisarmed));
}

// =============================================================================
// PIPELINE STEPS IN ORDER
// =============================================================================

#[tokio::test]
async fn test_armed_happy_path_places_order() {
    let fix = fixture();
    arm(&fix).await;

    let raw = signed_envelope(&fix, 1, 1);
    let outcome = fix.motor.process_raw_intent(&raw).await;

    let PipelineOutcome::Accepted(event) = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(event.order_id, "O-1");
    assert_eq!(fix.venue.orders_placed(), 1);
    assert_eq!(fix.sink.accepted.lock().len(), 1);
    // Shadow records the pending exposure.
    let position = fix.motor.book().position("BTCUSDT").await.unwrap();
    assert_eq!(position.pending_qty, dec!(1));
}

use crate::service::PipelineOutcome;

#[tokio::test]
async fn test_malformed_after_arm() {
    let fix = fixture();
    arm(&fix).await;
    let outcome = fix.motor.process_raw_intent(b"{\"payload\":{}}").await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::Malformed));
    assert_eq!(fix.venue.attempts(), 0);
}

#[tokio::test]
async fn test_timestamp_window_boundaries() {
    let fix = fixture();
    arm(&fix).await;

    // Exactly at the +300_000 ms boundary: accepted.
    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        fix.motor.policy_hash(),
        "brain-a".to_string(),
        1,
        fix.time.now_ms() + 300_000,
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));

    // One millisecond beyond: rejected.
    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        fix.motor.policy_hash(),
        "brain-a".to_string(),
        1,
        fix.time.now_ms() + 300_001,
        2,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::TimestampSkew));
}

#[tokio::test]
async fn test_hmac_one_byte_off_no_shadow_change() {
    let fix = fixture();
    arm(&fix).await;

    let mut envelope: IntentEnvelope =
        serde_json::from_slice(&signed_envelope(&fix, 1, 1)).unwrap();
    let mut sig = envelope.signature.into_bytes();
    sig[0] = if sig[0] == b'a' { b'b' } else { b'a' };
    envelope.signature = String::from_utf8(sig).unwrap();

    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::HmacInvalid));
    assert_eq!(fix.venue.attempts(), 0);
    assert!(fix.motor.book().position("BTCUSDT").await.is_none());
}

#[tokio::test]
async fn test_unknown_issuer_fails_as_hmac_invalid() {
    let fix = fixture();
    arm(&fix).await;

    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        fix.motor.policy_hash(),
        "brain-unknown".to_string(),
        1,
        fix.time.now_ms(),
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::HmacInvalid));
}

#[tokio::test]
async fn test_nonce_replay_identical_bytes() {
    let fix = fixture();
    arm(&fix).await;

    let raw = signed_envelope(&fix, 42, 1);
    let first = fix.motor.process_raw_intent(&raw).await;
    assert!(matches!(first, PipelineOutcome::Accepted(_)));

    // Identical bytes again: replay.
    let second = fix.motor.process_raw_intent(&raw).await;
    assert_eq!(second.reject_reason(), Some(RejectReason::NonceReplay));
    assert_eq!(fix.venue.orders_placed(), 1);
}

#[tokio::test]
async fn test_term_fencing_boundaries() {
    let fix = fixture();
    arm(&fix).await;

    // Term 5 accepted.
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 5)).await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));

    // Equal term accepted (same leader).
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 2, 5)).await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));

    // One less: fenced out, reported as nonce_replay.
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 3, 4)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::NonceReplay));
}

#[tokio::test]
async fn test_policy_hash_mismatch_after_arm() {
    let fix = fixture();
    arm(&fix).await;

    let wrong_hash = shared_types::PolicyHash([7u8; 32]);
    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        wrong_hash,
        "brain-a".to_string(),
        1,
        fix.time.now_ms(),
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;

    let PipelineOutcome::Rejected(event) = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(event.reason, RejectReason::PolicyHashMismatch);
    assert_eq!(event.expected_policy_hash, Some(fix.motor.policy_hash()));
    assert_eq!(event.got_policy_hash, Some(wrong_hash));
}

#[tokio::test]
async fn test_unknown_symbol() {
    let fix = fixture();
    arm(&fix).await;

    let mut p = payload(Uuid::new_v4());
    p.symbol = "DOGEUSDT".to_string();
    let envelope = IntentEnvelope::signed(
        p,
        fix.motor.policy_hash(),
        "brain-a".to_string(),
        1,
        fix.time.now_ms(),
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::UnknownSymbol));
}

#[tokio::test]
async fn test_rate_limiter_exhaustion() {
    let fix = fixture();
    arm(&fix).await;

    // Policy allows a burst of 10; the eleventh in the same instant fails.
    for nonce in 1..=10 {
        let outcome = fix
            .motor
            .process_raw_intent(&signed_envelope(&fix, nonce, 1))
            .await;
        assert!(matches!(outcome, PipelineOutcome::Accepted(_)), "order {nonce}");
    }
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 11, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::RateLimited));

    // A second later the bucket has refilled.
    fix.time.advance(1_000);
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 12, 1)).await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));
}

#[tokio::test]
async fn test_risk_guard_notional_cap() {
    let fix = fixture();
    arm(&fix).await;

    let mut p = payload(Uuid::new_v4());
    p.quantity = dec!(2000); // 2000 x 100 = 200k > 100k cap
    let envelope = IntentEnvelope::signed(
        p,
        fix.motor.policy_hash(),
        "brain-a".to_string(),
        1,
        fix.time.now_ms(),
        1,
        BRAIN_SECRET,
    )
    .unwrap();
    let outcome = fix
        .motor
        .process_raw_intent(&serde_json::to_vec(&envelope).unwrap())
        .await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::RiskExceeded));
    assert_eq!(fix.venue.attempts(), 0);
}

// =============================================================================
// EXCHANGE SUBMIT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retried_then_succeed() {
    let fix = fixture();
    arm(&fix).await;
    fix.venue.script_failures(vec![
        ExchangeError::Transient("502".to_string()),
        ExchangeError::Transient("timeout".to_string()),
    ]);

    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));
    assert_eq!(fix.venue.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_exhaust_retries() {
    let fix = fixture();
    arm(&fix).await;
    fix.venue.script_failures(vec![
        ExchangeError::Transient("a".to_string());
        4
    ]);

    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::ExchangeRejected));
    assert_eq!(fix.venue.attempts(), 4);
}

#[tokio::test]
async fn test_fatal_error_not_retried() {
    let fix = fixture();
    arm(&fix).await;
    fix.venue
        .script_failures(vec![ExchangeError::Fatal("bad lot size".to_string())]);

    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::ExchangeRejected));
    assert_eq!(fix.venue.attempts(), 1);
}

#[tokio::test]
async fn test_venue_429_maps_to_rate_limited() {
    let fix = fixture();
    arm(&fix).await;
    fix.venue
        .script_failures(vec![ExchangeError::RateLimited("429".to_string())]);

    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::RateLimited));
    assert_eq!(fix.venue.attempts(), 1);
}

// =============================================================================
// BREAKER & EMERGENCY
// =============================================================================

#[tokio::test]
async fn test_breaker_defensive_blocks_with_circuit_open() {
    let fix = fixture();
    arm(&fix).await;

    // Drive a losing day past the halt threshold via fills.
    fix.motor
        .ingest_fill(FillEvent {
            fill_id: "F-a".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-a".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            filled_qty: dec!(10),
            fill_price: dec!(100),
            fees: Decimal::ZERO,
            filled_at: fix.time.now_ms(),
        })
        .await
        .unwrap();
    fix.motor
        .ingest_fill(FillEvent {
            fill_id: "F-b".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-b".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            filled_qty: dec!(10),
            fill_price: dec!(-60), // forced deep loss: (-60 - 100) * 10 = -1600
            fees: Decimal::ZERO,
            filled_at: fix.time.now_ms(),
        })
        .await
        .unwrap();

    assert_eq!(fix.motor.breaker_state(), BreakerState::Defensive);
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::CircuitOpen));
}

#[tokio::test]
async fn test_emergency_flattens_and_disarms() {
    let fix = fixture();
    arm(&fix).await;

    // Open a position.
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;
    assert!(matches!(outcome, PipelineOutcome::Accepted(_)));
    fix.motor
        .ingest_fill(FillEvent {
            fill_id: "F-1".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            filled_qty: dec!(1),
            fill_price: dec!(100),
            fees: Decimal::ZERO,
            filled_at: fix.time.now_ms(),
        })
        .await
        .unwrap();

    // Catastrophic loss crosses the emergency threshold.
    fix.motor
        .ingest_fill(FillEvent {
            fill_id: "F-2".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-2".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            filled_qty: dec!(1),
            fill_price: dec!(100),
            fees: dec!(3500), // fee shock pushes realized pnl past -3000
            filled_at: fix.time.now_ms(),
        })
        .await
        .unwrap();

    assert_eq!(fix.motor.breaker_state(), BreakerState::Emergency);
    // Flatten placed a closing market order and the interlock dropped.
    assert_eq!(fix.motor.armed_state(), ArmedState::Disarmed);
    assert_eq!(fix.store.load_armed().unwrap(), ArmedState::Disarmed);
    assert_eq!(fix.store.load_breaker().unwrap(), BreakerState::Emergency);

    // Subsequent intents bounce off the interlock (which precedes the
    // breaker in the chain).
    let outcome = fix.motor.process_raw_intent(&signed_envelope(&fix, 9, 1)).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::SystemDisarmed));

    // State-change events were emitted for both machines.
    let changes = fix.sink.state_changes.lock();
    assert!(changes.iter().any(|c| c.to == "emergency"));
    assert!(changes.iter().any(|c| c.to == "disarmed"));
}

#[tokio::test]
async fn test_operator_halt_full_sequence() {
    let fix = fixture();
    arm(&fix).await;
    fix.motor.process_raw_intent(&signed_envelope(&fix, 1, 1)).await;

    let cmd =
        OperatorCommand::signed(OperatorAction::Halt, "ops-1", fix.time.now_ms(), OPERATOR_SECRET);
    fix.motor.handle_operator_command(&cmd).await.unwrap();

    assert_eq!(fix.motor.breaker_state(), BreakerState::Emergency);
    assert_eq!(fix.motor.armed_state(), ArmedState::Disarmed);
    // The audit log recorded the action.
    assert!(fix.store.audit_lines().iter().any(|l| l.contains("halt")));
}

#[tokio::test]
async fn test_operator_command_bad_signature_refused() {
    let fix = fixture();
    let cmd = OperatorCommand::signed(OperatorAction::Arm, "ops-1", fix.time.now_ms(), b"wrong");
    assert!(fix.motor.handle_operator_command(&cmd).await.is_err());
    assert_eq!(fix.motor.armed_state(), ArmedState::Disarmed);
}

#[tokio::test]
async fn test_operator_deescalate_steps_down() {
    let fix = fixture();
    arm(&fix).await;
    let halt =
        OperatorCommand::signed(OperatorAction::Halt, "ops-1", fix.time.now_ms(), OPERATOR_SECRET);
    fix.motor.handle_operator_command(&halt).await.unwrap();
    assert_eq!(fix.motor.breaker_state(), BreakerState::Emergency);

    let deescalate = OperatorCommand::signed(
        OperatorAction::BreakerDeescalate,
        "ops-1",
        fix.time.now_ms(),
        OPERATOR_SECRET,
    );
    fix.motor.handle_operator_command(&deescalate).await.unwrap();
    assert_eq!(fix.motor.breaker_state(), BreakerState::Defensive);
    assert_eq!(fix.store.load_breaker().unwrap(), BreakerState::Defensive);
}

// =============================================================================
// DRIFT
// =============================================================================

#[tokio::test]
async fn test_persistent_drift_escalates_to_defensive() {
    let fix = fixture();
    arm(&fix).await;

    let drift = DriftEvent {
        account: "main".to_string(),
        symbol: "BTCUSDT".to_string(),
        shadow_size: dec!(5),
        exchange_size: dec!(1),
        tolerance: dec!(0.001),
        timestamp: fix.time.now_ms(),
    };
    // Magnitude far past the soft threshold: immediately persistent.
    fix.motor.on_drift(drift).await.unwrap();

    assert_eq!(fix.motor.breaker_state(), BreakerState::Defensive);
    assert_eq!(fix.sink.drifts.lock().len(), 1);
}

#[tokio::test]
async fn test_transient_drift_reported_not_escalated() {
    let fix = fixture();
    let drift = DriftEvent {
        account: "main".to_string(),
        symbol: "BTCUSDT".to_string(),
        shadow_size: dec!(1.002),
        exchange_size: dec!(1),
        tolerance: dec!(0.001),
        timestamp: fix.time.now_ms(),
    };
    fix.motor.on_drift(drift).await.unwrap();

    assert_eq!(fix.motor.breaker_state(), BreakerState::Normal);
    assert_eq!(fix.sink.drifts.lock().len(), 1);
}

// =============================================================================
// RESTART
// =============================================================================

#[tokio::test]
async fn test_replay_guard_survives_restart() {
    let store = Arc::new(MemoryStateStore::new());
    let time = MockTime::shared(T0);
    let venue = Arc::new(PaperExchange::auto_filling(dec!(1000000)));
    venue.set_mark("BTCUSDT", dec!(100));

    let build = |store: Arc<MemoryStateStore>, venue: Arc<PaperExchange>, time: Arc<MockTime>| {
        let mut issuers = HashMap::new();
        issuers.insert("brain-a".to_string(), BRAIN_SECRET.to_vec());
        MotorService::new(MotorDependencies {
            config: MotorConfig {
                account: "main".to_string(),
                exchange: "paper".to_string(),
                identity: "motor".to_string(),
            },
            policy: Arc::new(policy()),
            exchange: venue,
            sink: Arc::new(RecordingSink::new()),
            keys: StaticKeyProvider::new(issuers, OPERATOR_SECRET.to_vec()),
            state_store: store as Arc<dyn StateStore>,
            time: time as Arc<dyn crate::ports::TimeSource>,
            book: Arc::new(ShadowBook::new("main")),
        })
        .unwrap()
    };

    let motor = build(Arc::clone(&store), Arc::clone(&venue), Arc::clone(&time));
    let arm_cmd = OperatorCommand::signed(OperatorAction::Arm, "ops-1", T0, OPERATOR_SECRET);
    motor.handle_operator_command(&arm_cmd).await.unwrap();

    let envelope = IntentEnvelope::signed(
        payload(Uuid::new_v4()),
        motor.policy_hash(),
        "brain-a".to_string(),
        3,
        T0,
        42,
        BRAIN_SECRET,
    )
    .unwrap();
    let raw = serde_json::to_vec(&envelope).unwrap();
    assert!(matches!(
        motor.process_raw_intent(&raw).await,
        PipelineOutcome::Accepted(_)
    ));
    drop(motor);

    // Restart: the same bytes replay against the restored guard.
    let motor = build(Arc::clone(&store), venue, time);
    assert_eq!(motor.armed_state(), ArmedState::Armed);
    let outcome = motor.process_raw_intent(&raw).await;
    assert_eq!(outcome.reject_reason(), Some(RejectReason::NonceReplay));
}
