//! End-to-end flows over one bus.
//!
//! The full organism on a single in-process bus:
//!
//! ```text
//! [strategy] ──signal──→ [Signal Gate] ──signed intent──→ [Motor Gate]
//!                                                              │
//!      [Ledger] ←──fill event── [Motor] ←──fill── [Paper Venue]┘
//! ```
//!
//! Scenario tests follow the safety triangle's contract: fail-closed
//! precedence, replay absorption, breaker emergency, ledger idempotence.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use rust_decimal::Decimal;
#[cfg(test)]
use rust_decimal_macros::dec;
#[cfg(test)]
use tokio::sync::watch;
#[cfg(test)]
use uuid::Uuid;

#[cfg(test)]
use rx_02_leader_elector::{LeaderElector, MemoryTermStore, SystemTimeSource, TermStore, TimeSource};
#[cfg(test)]
use rx_03_motor_gate::adapters::{BusEventSink, PaperExchange};
#[cfg(test)]
use rx_03_motor_gate::{
    MemoryStateStore, MotorConfig, MotorDependencies, MotorService, StateStore, StaticKeyProvider,
};
#[cfg(test)]
use rx_04_shadow_state::{Reconciler, ShadowBook};
#[cfg(test)]
use rx_05_signal_gate::{
    ApprovalPorts, MemoryDedupStore, OpenPorts, SignalGate, SignalGateDependencies,
};
#[cfg(test)]
use rx_06_ledger::{Ledger, LedgerConsumer, MemoryKVStore};
#[cfg(test)]
use shared_bus::{subjects, AclMatrix, Identity, MemoryCursorStore, MessageBus, Subscription};
#[cfg(test)]
use shared_types::{
    ArmedState, BreakerState, BreakerThresholds, CanonicalPolicy, DriftEvent, FillEvent,
    IntentEnvelope, IntentPayload, OperatorAction, OperatorCommand, OrderType, RejectReason,
    RejectionEvent, Side, SignalEvent, SymbolPolicy,
};

#[cfg(test)]
const BRAIN_SECRET: &[u8] = b"brain-shared-secret";
#[cfg(test)]
const OPERATOR_SECRET: &[u8] = b"operator-shared-secret";

#[cfg(test)]
fn test_policy() -> CanonicalPolicy {
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
        strategy_daily_loss_cap: dec!(100000),
        breaker: BreakerThresholds {
            daily_loss_warn: dec!(500),
            daily_loss_halt: dec!(1500),
            daily_loss_emergency: dec!(3000),
            consecutive_losses: 50,
            reject_rate_per_min: 1000,
            emergency_order_notional_cap: dec!(100000),
        },
        orders_per_second: 100,
        default_recon_tolerance: dec!(0.001),
    }
}

/// The whole organism wired over one bus.
#[cfg(test)]
struct Organism {
    bus: Arc<MessageBus>,
    venue: Arc<PaperExchange>,
    motor: Arc<MotorService<PaperExchange, BusEventSink, StaticKeyProvider>>,
    gate: Arc<SignalGate<OpenPorts, OpenPorts, OpenPorts>>,
    ledger: Arc<Ledger<MemoryKVStore>>,
    policy: Arc<CanonicalPolicy>,
    motor_id: Identity,
    brain_id: Identity,
    operator_id: Identity,
    strategy_id: Identity,
    shutdown: watch::Sender<bool>,
}

#[cfg(test)]
impl Organism {
    async fn boot() -> Self {
        let motor_id = Identity::new("motor");
        let brain_id = Identity::new("brain-a");
        let operator_id = Identity::new("operator");
        let strategy_id = Identity::new("strategy");
        let acl = AclMatrix::reflex_default(
            &motor_id,
            std::slice::from_ref(&brain_id),
            &operator_id,
            std::slice::from_ref(&strategy_id),
        );
        let bus = Arc::new(MessageBus::new(acl, Arc::new(MemoryCursorStore::new())));

        let venue = Arc::new(PaperExchange::auto_filling(dec!(10000000)));
        venue.set_mark("BTCUSDT", dec!(100));
        let policy = Arc::new(test_policy());

        let mut issuers = HashMap::new();
        issuers.insert("brain-a".to_string(), BRAIN_SECRET.to_vec());
        let motor = Arc::new(
            MotorService::new(MotorDependencies {
                config: MotorConfig {
                    account: "main".to_string(),
                    exchange: "paper".to_string(),
                    identity: "motor".to_string(),
                },
                policy: Arc::clone(&policy),
                exchange: Arc::clone(&venue),
                sink: Arc::new(BusEventSink::new(Arc::clone(&bus), motor_id.clone())),
                keys: StaticKeyProvider::new(issuers, OPERATOR_SECRET.to_vec()),
                state_store: Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>,
                time: Arc::new(rx_03_motor_gate::SystemTimeSource)
                    as Arc<dyn rx_03_motor_gate::TimeSource>,
                book: Arc::new(ShadowBook::new("main")),
            })
            .unwrap(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);

        // Motor command loop.
        let commands = bus.subscribe(&motor_id, "motor-commands", "reflex.cmd.").unwrap();
        {
            let motor = Arc::clone(&motor);
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { motor.run(commands, rx).await });
        }

        // Venue fill pump into the Motor.
        {
            let motor = Arc::clone(&motor);
            let mut fills = venue.fills();
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                return;
                            }
                        }
                        fill = fills.recv() => {
                            let Some(fill) = fill else { return };
                            let _ = motor.ingest_fill(fill).await;
                        }
                    }
                }
            });
        }

        // Elector + promotion.
        let elector = LeaderElector::with_lease_ms(
            "brain-a",
            brain_id.clone(),
            Arc::clone(&bus),
            Arc::new(MemoryTermStore::new()) as Arc<dyn TermStore>,
            Arc::new(SystemTimeSource) as Arc<dyn TimeSource>,
            600,
        )
        .unwrap();
        let elector_handle = elector.handle("brain-a");
        tokio::spawn(elector.run(shutdown_rx.clone()));
        let mut leadership = elector_handle.watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !leadership.borrow().is_leader() {
                leadership.changed().await.unwrap();
            }
        })
        .await
        .expect("elector never promoted");

        // Signal gate loop.
        let gate = Arc::new(SignalGate::new(SignalGateDependencies {
            bus: Arc::clone(&bus),
            identity: brain_id.clone(),
            elector: elector_handle,
            policy: Arc::clone(&policy),
            dedup: Arc::new(MemoryDedupStore::new()),
            nonce_store: Arc::new(MemoryTermStore::new()) as Arc<dyn TermStore>,
            ports: ApprovalPorts {
                strategies: OpenPorts,
                flow: OpenPorts,
                regime: OpenPorts,
            },
            issuer_secret: BRAIN_SECRET.to_vec(),
            equity: dec!(10000000),
        }));
        let signals = bus
            .subscribe(&brain_id, "brain-signals", subjects::SIGNAL_PREFIX)
            .unwrap();
        let policy_ads = bus
            .subscribe(&brain_id, "brain-policy", subjects::EXECUTION_POLICY)
            .unwrap();
        {
            let gate = Arc::clone(&gate);
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { gate.run(signals, policy_ads, rx).await });
        }

        // Ledger consumer loop.
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryKVStore::new()), "main"));
        let consumer = LedgerConsumer::new(Arc::clone(&ledger), Arc::clone(&bus), brain_id.clone());
        let fills_sub = bus
            .subscribe(&brain_id, "ledger-fills", subjects::EXECUTION_FILL)
            .unwrap();
        {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { consumer.run(fills_sub, rx).await });
        }

        // Handshake: Motor advertises, the gate observes via its loop.
        motor.advertise_policy().await;

        Self {
            bus,
            venue,
            motor,
            gate,
            ledger,
            policy,
            motor_id,
            brain_id,
            operator_id,
            strategy_id,
            shutdown,
        }
    }

    fn reject_watch(&self) -> Subscription {
        self.bus
            .subscribe(&self.brain_id, "reject-watch", subjects::EXEC_REJECT)
            .unwrap()
    }

    async fn arm(&self) {
        let cmd = OperatorCommand::signed(
            OperatorAction::Arm,
            "ops-1",
            shared_types::now_ms(),
            OPERATOR_SECRET,
        );
        self.bus
            .publish_json(&self.operator_id, subjects::OPERATOR_ARM, &cmd)
            .await
            .unwrap();
        wait_until(|| self.motor.armed_state() == ArmedState::Armed).await;
    }

    async fn wait_handshake(&self) {
        wait_until(|| self.gate.is_policy_synced()).await;
    }

    fn signal(&self, id: &str, qty: Decimal, price: Decimal) -> SignalEvent {
        SignalEvent {
            signal_id: id.to_string(),
            strategy_id: "phase3".to_string(),
            phase: "phase3".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: qty,
            limit_price: Some(price),
            stop_loss: None,
            take_profit: None,
            leverage: 2,
            issued_at: shared_types::now_ms(),
        }
    }

    fn payload(&self, intent_id: Uuid) -> IntentPayload {
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
            client_order_tag: "direct".to_string(),
        }
    }

    async fn publish_intent_raw(&self, raw: &[u8]) {
        use shared_bus::BusPublisher;
        self.bus
            .publish(
                &self.brain_id,
                &subjects::place_intent("BTCUSDT"),
                raw.to_vec(),
            )
            .await
            .unwrap();
    }

    fn signed_intent(&self, intent_id: Uuid, nonce: u64, term: u64) -> Vec<u8> {
        let envelope = IntentEnvelope::signed(
            self.payload(intent_id),
            self.motor.policy_hash(),
            "brain-a".to_string(),
            term,
            shared_types::now_ms(),
            nonce,
            BRAIN_SECRET,
        )
        .unwrap();
        serde_json::to_vec(&envelope).unwrap()
    }
}

#[cfg(test)]
impl Drop for Organism {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Poll a condition with a 2 s budget.
#[cfg(test)]
async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[cfg(test)]
async fn next_reject(sub: &mut Subscription) -> RejectionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let message = sub.recv().await.expect("reject stream closed");
            if let Ok(event) = message.decode::<RejectionEvent>() {
                return event;
            }
        }
    })
    .await
    .expect("no rejection event arrived")
}

// =============================================================================
// FULL FLOW
// =============================================================================

#[cfg(test)]
mod full_flow {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_signal_to_ledger_round_trip() {
        let organism = Organism::boot().await;
        organism.arm().await;
        organism.wait_handshake().await;

        // Strategy fires a signal.
        organism
            .bus
            .publish_json(
                &organism.strategy_id,
                &subjects::signal("phase3"),
                &organism.signal("sig-rt-1", dec!(2), dec!(100)),
            )
            .await
            .unwrap();

        // Gate -> Motor -> venue -> fill -> shadow -> ledger.
        wait_until(|| organism.venue.orders_placed() == 1).await;
        wait_until(|| {
            organism
                .ledger
                .transactions()
                .map(|t| t.len() == 1)
                .unwrap_or(false)
        })
        .await;

        let position = organism.motor.book().position("BTCUSDT").await.unwrap();
        assert_eq!(position.size, dec!(2));
        assert_eq!(position.avg_entry_price, dec!(100));

        let transactions = organism.ledger.transactions().unwrap();
        assert_eq!(transactions[0].amount, dec!(200));
        let entries = organism
            .ledger
            .entries(&transactions[0].transaction_id)
            .unwrap();
        assert_eq!(entries.len(), 2);

        // The same signal again is deduplicated end to end.
        organism
            .bus
            .publish_json(
                &organism.strategy_id,
                &subjects::signal("phase3"),
                &organism.signal("sig-rt-1", dec!(2), dec!(100)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(organism.venue.orders_placed(), 1);
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[cfg(test)]
mod scenarios {
    use super::*;

    /// Scenario 1: disarmed rejection, exact intent id, no exchange call.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_disarmed_rejection() {
        let organism = Organism::boot().await;
        let mut rejects = organism.reject_watch();

        let intent_id = Uuid::parse_str("75b2f6e4-9d4a-4ab9-9d2f-0d8b3f1c2a4e").unwrap();
        let raw = organism.signed_intent(intent_id, 1, 1);
        organism.publish_intent_raw(&raw).await;

        let event = next_reject(&mut rejects).await;
        assert_eq!(event.reason, RejectReason::SystemDisarmed);
        assert_eq!(event.intent_id, Some(intent_id));
        assert_eq!(organism.venue.attempts(), 0);
    }

    /// Scenario 2: wrong policy hash while disarmed still reads
    /// `system_disarmed` (interlock precedes the hash check).
    #[tokio::test(flavor = "multi_thread")]
    async fn test_policy_mismatch_masked_by_disarm() {
        let organism = Organism::boot().await;
        let mut rejects = organism.reject_watch();

        let envelope = IntentEnvelope::signed(
            organism.payload(Uuid::new_v4()),
            shared_types::PolicyHash([0xAB; 32]),
            "brain-a".to_string(),
            1,
            shared_types::now_ms(),
            1,
            BRAIN_SECRET,
        )
        .unwrap();
        organism
            .publish_intent_raw(&serde_json::to_vec(&envelope).unwrap())
            .await;

        let event = next_reject(&mut rejects).await;
        assert_eq!(event.reason, RejectReason::SystemDisarmed);
    }

    /// Scenario 3: one-byte-off MAC after arming.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_hmac_fail_after_arm() {
        let organism = Organism::boot().await;
        organism.arm().await;
        let mut rejects = organism.reject_watch();

        let mut envelope: IntentEnvelope =
            serde_json::from_slice(&organism.signed_intent(Uuid::new_v4(), 1, 1)).unwrap();
        let mut sig = envelope.signature.into_bytes();
        sig[10] = if sig[10] == b'0' { b'1' } else { b'0' };
        envelope.signature = String::from_utf8(sig).unwrap();
        organism
            .publish_intent_raw(&serde_json::to_vec(&envelope).unwrap())
            .await;

        let event = next_reject(&mut rejects).await;
        assert_eq!(event.reason, RejectReason::HmacInvalid);
        assert!(organism.motor.book().position("BTCUSDT").await.is_none());
    }

    /// Scenario 4: identical bytes replayed.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_nonce_replay() {
        let organism = Organism::boot().await;
        organism.arm().await;
        let mut rejects = organism.reject_watch();

        let raw = organism.signed_intent(Uuid::new_v4(), 42, 1);
        organism.publish_intent_raw(&raw).await;
        wait_until(|| organism.venue.orders_placed() == 1).await;

        organism.publish_intent_raw(&raw).await;
        let event = next_reject(&mut rejects).await;
        assert_eq!(event.reason, RejectReason::NonceReplay);
        assert_eq!(organism.venue.orders_placed(), 1);
    }

    /// Scenario 5: duplicate fill into the ledger.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fill_duplicate_into_ledger() {
        let organism = Organism::boot().await;

        let fill = FillEvent {
            fill_id: "F-X".to_string(),
            intent_id: Uuid::new_v4(),
            order_id: "O-X".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            filled_qty: dec!(1),
            fill_price: dec!(100),
            fees: dec!(0.1),
            filled_at: shared_types::now_ms(),
        };
        for _ in 0..2 {
            organism
                .bus
                .publish_json(&organism.motor_id, subjects::EXECUTION_FILL, &fill)
                .await
                .unwrap();
        }

        wait_until(|| {
            organism
                .ledger
                .fill("F-X")
                .map(|f| f.is_some())
                .unwrap_or(false)
        })
        .await;
        // Give the second (idempotent) delivery time to land.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let transactions = organism.ledger.transactions().unwrap();
        assert_eq!(transactions.len(), 1);
        let entries = organism
            .ledger
            .entries(&transactions[0].transaction_id)
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, entries[1].amount);
    }

    /// Scenario 6: daily loss crossing the emergency cap during a
    /// reconciliation tick: EMERGENCY, flatten-all, disarm, state events,
    /// and `circuit_open` once the operator re-arms.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_breaker_emergency_on_reconcile_tick() {
        let organism = Organism::boot().await;
        organism.arm().await;
        organism.wait_handshake().await;
        let mut rejects = organism.reject_watch();
        let mut state_events = organism
            .bus
            .subscribe(&organism.brain_id, "state-watch", subjects::EXECUTION_STATE)
            .unwrap();

        // Open a long through the pipeline and let the fill land.
        organism
            .publish_intent_raw(&organism.signed_intent(Uuid::new_v4(), 1, 1))
            .await;
        wait_until(|| organism.venue.orders_placed() == 1).await;
        let book = organism.motor.book();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let landed = book
                    .position("BTCUSDT")
                    .await
                    .map(|p| p.size == dec!(1))
                    .unwrap_or(false);
                if landed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fill never landed in shadow");

        // A catastrophic loss lands in the shadow book between breaker
        // evaluations (fee shock on a fill applied straight to the book).
        organism
            .motor
            .book()
            .apply_fill(&FillEvent {
                fill_id: "F-loss".to_string(),
                intent_id: Uuid::new_v4(),
                order_id: "O-loss".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                filled_qty: dec!(1),
                fill_price: dec!(100),
                fees: dec!(3500), // realized pnl now below -3000
                filled_at: shared_types::now_ms(),
            })
            .await
            .unwrap();

        // The reconciliation tick re-evaluates daily loss.
        let reconciler = Reconciler::new(
            organism.motor.book(),
            Arc::clone(&organism.venue),
            Arc::new(NullDrift),
            Arc::clone(&organism.policy),
        );
        let _ = reconciler.reconcile_once(shared_types::now_ms()).await.unwrap();
        organism.motor.evaluate_daily_loss().await.unwrap();

        assert_eq!(organism.motor.breaker_state(), BreakerState::Emergency);
        assert_eq!(organism.motor.armed_state(), ArmedState::Disarmed);
        // Flatten-all placed closing market orders for the open position.
        assert!(organism.venue.orders_placed() > 1);

        // State-change events for both the breaker and the interlock.
        let mut saw_emergency = false;
        let mut saw_disarm = false;
        while let Some(message) = state_events.try_recv() {
            if let Ok(event) = message.decode::<shared_types::StateChangeEvent>() {
                saw_emergency |= event.to == "emergency";
                saw_disarm |= event.to == "disarmed";
            }
        }
        assert!(saw_emergency);
        assert!(saw_disarm);

        // Re-arm: the breaker (still EMERGENCY) now answers circuit_open.
        organism.arm().await;
        organism
            .publish_intent_raw(&organism.signed_intent(Uuid::new_v4(), 99, 1))
            .await;
        loop {
            let event = next_reject(&mut rejects).await;
            if event.reason == RejectReason::CircuitOpen {
                break;
            }
        }
    }

    struct NullDrift;

    #[async_trait::async_trait]
    impl rx_04_shadow_state::DriftSink for NullDrift {
        async fn report(&self, _event: DriftEvent) {}
    }
}
