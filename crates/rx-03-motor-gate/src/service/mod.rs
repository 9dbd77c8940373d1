//! Motor service: state ownership, operator commands, halt, fills.
//!
//! The intent pipeline itself lives in [`pipeline`]; this module owns the
//! guarded state (armed, breaker, replay guard, rate limiter, drift
//! detector) and every transition of it.

mod pipeline;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use rx_04_shadow_state::ShadowBook;
use shared_bus::{subjects, StreamMessage, Subscription};
use shared_types::{
    ArmedState, BreakerState, BucketRegistry, CanonicalPolicy, DriftEvent, FillEvent,
    OperatorAction, OperatorCommand, OrderType, PolicyAdvertisedEvent, PolicyHash, ReplayGuard,
    Side, StateChangeEvent, StateChangeKind, TIMESTAMP_WINDOW_MS,
};

use crate::domain::breaker::BreakerTransition;
use crate::domain::{ArmedInterlock, CircuitBreaker, DriftClass, DriftDetector, MotorError};
use crate::ports::{
    EventSink, ExchangeGateway, KeyProvider, OrderRequest, StateStore, TimeSource,
};

pub use pipeline::PipelineOutcome;

/// Static Motor configuration.
#[derive(Debug, Clone)]
pub struct MotorConfig {
    /// Account whose positions this Motor owns.
    pub account: String,
    /// Exchange name (rate-limiter key).
    pub exchange: String,
    /// This process's identity string (event correlation).
    pub identity: String,
}

/// Constructor dependencies, bundled to keep the signature flat.
pub struct MotorDependencies<E, S, K> {
    pub config: MotorConfig,
    pub policy: Arc<CanonicalPolicy>,
    pub exchange: Arc<E>,
    pub sink: Arc<S>,
    pub keys: K,
    pub state_store: Arc<dyn StateStore>,
    pub time: Arc<dyn TimeSource>,
    pub book: Arc<ShadowBook>,
}

/// The Motor.
pub struct MotorService<E, S, K>
where
    E: ExchangeGateway,
    S: EventSink,
    K: KeyProvider,
{
    config: MotorConfig,
    policy: Arc<CanonicalPolicy>,
    policy_hash: PolicyHash,
    exchange: Arc<E>,
    sink: Arc<S>,
    keys: K,
    state_store: Arc<dyn StateStore>,
    time: Arc<dyn TimeSource>,
    book: Arc<ShadowBook>,
    armed: RwLock<ArmedState>,
    breaker: Mutex<CircuitBreaker>,
    pub(crate) replay: Mutex<ReplayGuard>,
    pub(crate) limiter: Mutex<BucketRegistry>,
    pub(crate) drift: Mutex<DriftDetector>,
}

impl<E, S, K> MotorService<E, S, K>
where
    E: ExchangeGateway,
    S: EventSink,
    K: KeyProvider,
{
    /// Construct the Motor, restoring durable state.
    pub fn new(deps: MotorDependencies<E, S, K>) -> Result<Self, MotorError> {
        let armed = deps
            .state_store
            .load_armed()
            .map_err(|e| MotorError::StateStore(e.to_string()))?;
        let breaker_state = deps
            .state_store
            .load_breaker()
            .map_err(|e| MotorError::StateStore(e.to_string()))?;
        let mut replay = ReplayGuard::new();
        replay.restore(
            deps.state_store
                .load_replay()
                .map_err(|e| MotorError::StateStore(e.to_string()))?,
        );

        let policy_hash = deps.policy.hash();
        let limiter = BucketRegistry::new(u64::from(deps.policy.orders_per_second));

        info!(
            armed = %armed,
            breaker = %breaker_state,
            policy_hash = %policy_hash,
            "Motor restored"
        );

        Ok(Self {
            config: deps.config,
            policy_hash,
            breaker: Mutex::new(CircuitBreaker::restored(
                deps.policy.breaker.clone(),
                breaker_state,
            )),
            policy: deps.policy,
            exchange: deps.exchange,
            sink: deps.sink,
            keys: deps.keys,
            state_store: deps.state_store,
            time: deps.time,
            book: deps.book,
            armed: RwLock::new(armed),
            replay: Mutex::new(replay),
            limiter: Mutex::new(limiter),
            drift: Mutex::new(DriftDetector::new()),
        })
    }

    /// The hash of the policy this Motor enforces.
    #[must_use]
    pub fn policy_hash(&self) -> PolicyHash {
        self.policy_hash
    }

    /// The loaded policy.
    #[must_use]
    pub fn policy(&self) -> &CanonicalPolicy {
        &self.policy
    }

    /// Current interlock state.
    #[must_use]
    pub fn armed_state(&self) -> ArmedState {
        *self.armed.read()
    }

    /// Current breaker state.
    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    /// The shadow book this Motor maintains.
    #[must_use]
    pub fn book(&self) -> Arc<ShadowBook> {
        Arc::clone(&self.book)
    }

    pub(crate) fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub(crate) fn exchange_gateway(&self) -> &E {
        &self.exchange
    }

    pub(crate) fn event_sink(&self) -> &S {
        &self.sink
    }

    pub(crate) fn keys(&self) -> &K {
        &self.keys
    }

    pub(crate) fn clock(&self) -> &dyn TimeSource {
        self.time.as_ref()
    }

    /// Advertise the loaded policy hash (boot, and on request).
    pub async fn advertise_policy(&self) {
        self.sink
            .policy_advertised(PolicyAdvertisedEvent {
                policy_hash: self.policy_hash,
                policy_version: self.policy.version,
                identity: self.config.identity.clone(),
                timestamp: self.time.now_ms(),
            })
            .await;
    }

    // =========================================================================
    // OPERATOR COMMANDS
    // =========================================================================

    /// Verify and execute a signed operator command.
    pub async fn handle_operator_command(&self, command: &OperatorCommand) -> Result<(), MotorError> {
        if !command.verify(&self.keys.operator_secret()) {
            return Err(MotorError::OperatorRejected(
                "signature verification failed".to_string(),
            ));
        }
        let now = self.time.now_ms();
        if (now - command.timestamp).abs() > TIMESTAMP_WINDOW_MS {
            return Err(MotorError::OperatorRejected(format!(
                "command timestamp {} outside window",
                command.timestamp
            )));
        }

        self.state_store
            .append_audit(&format!(
                "{now} {} by {} ({})",
                command.action, command.actor_id, command.command_id
            ))
            .map_err(|e| MotorError::StateStore(e.to_string()))?;

        match command.action {
            OperatorAction::Arm | OperatorAction::Disarm => {
                let target = ArmedInterlock::transition(self.armed_state(), command.action)?;
                self.apply_armed_transition(target, &format!("operator {}", command.actor_id))
                    .await
            }
            OperatorAction::Halt => self.halt(&format!("operator {}", command.actor_id)).await,
            OperatorAction::BreakerDeescalate => {
                let transition = self.breaker.lock().deescalate();
                if let Some(transition) = transition {
                    self.persist_breaker_transition(&transition).await?;
                }
                Ok(())
            }
        }
    }

    /// Move the interlock, write-through then notify. Same-state writes are
    /// no-ops.
    pub(crate) async fn apply_armed_transition(
        &self,
        target: ArmedState,
        reason: &str,
    ) -> Result<(), MotorError> {
        let current = self.armed_state();
        if current == target {
            return Ok(());
        }
        // Durable before acknowledged: persist, then swap, then notify.
        self.state_store
            .store_armed(target)
            .map_err(|e| MotorError::StateStore(e.to_string()))?;
        *self.armed.write() = target;
        info!(from = %current, to = %target, reason, "Interlock transition");
        self.sink
            .state_change(StateChangeEvent {
                kind: StateChangeKind::Armed,
                from: current.to_string(),
                to: target.to_string(),
                reason: reason.to_string(),
                timestamp: self.time.now_ms(),
            })
            .await;
        Ok(())
    }

    /// Operator HALT: pause, flatten, disarm, notify.
    pub async fn halt(&self, reason: &str) -> Result<(), MotorError> {
        // Pause the pipeline first so nothing new is placed mid-flatten.
        self.apply_armed_transition(ArmedState::Halted, reason).await?;

        let transition = self.breaker.lock().operator_halt();
        if let Some(transition) = transition {
            self.persist_breaker_transition(&transition).await?;
        } else {
            // Already in EMERGENCY; flatten regardless.
            self.flatten_all().await?;
            self.apply_armed_transition(ArmedState::Disarmed, "post-halt flatten").await?;
        }
        Ok(())
    }

    // =========================================================================
    // BREAKER
    // =========================================================================

    /// Persist and announce a breaker transition; EMERGENCY entry triggers
    /// flatten-all and drives the interlock to DISARMED.
    pub(crate) async fn persist_breaker_transition(
        &self,
        transition: &BreakerTransition,
    ) -> Result<(), MotorError> {
        self.state_store
            .store_breaker(transition.to)
            .map_err(|e| MotorError::StateStore(e.to_string()))?;
        warn!(
            from = %transition.from,
            to = %transition.to,
            trigger = %transition.trigger,
            "Breaker transition"
        );
        self.sink
            .state_change(StateChangeEvent {
                kind: StateChangeKind::Breaker,
                from: transition.from.to_string(),
                to: transition.to.to_string(),
                reason: transition.trigger.to_string(),
                timestamp: self.time.now_ms(),
            })
            .await;

        if transition.to == BreakerState::Emergency {
            self.flatten_all().await?;
            self.apply_armed_transition(ArmedState::Disarmed, "emergency flatten").await?;
        }
        Ok(())
    }

    /// Re-evaluate the daily-loss thresholds (called after fills and after
    /// each reconciliation pass).
    pub async fn evaluate_daily_loss(&self) -> Result<(), MotorError> {
        let pnl = self.book.total_realized_pnl().await;
        let transition = self.breaker.lock().evaluate_daily_pnl(pnl);
        if let Some(transition) = transition {
            self.persist_breaker_transition(&transition).await?;
        }
        Ok(())
    }

    // =========================================================================
    // FILLS & DRIFT
    // =========================================================================

    /// Absorb an exchange fill: shadow update, fill event, breaker feed.
    pub async fn ingest_fill(&self, fill: FillEvent) -> Result<(), MotorError> {
        let realized_before = self
            .book
            .position(&fill.symbol)
            .await
            .map(|p| p.realized_pnl)
            .unwrap_or(Decimal::ZERO);

        if let Err(e) = self.book.apply_fill(&fill).await {
            // A fill the shadow cannot absorb is an invariant failure.
            error!(fill_id = %fill.fill_id, error = %e, "Fill rejected by shadow state");
            return Err(MotorError::StateStore(e.to_string()));
        }

        let realized_after = self
            .book
            .position(&fill.symbol)
            .await
            .map(|p| p.realized_pnl)
            .unwrap_or(Decimal::ZERO);
        let realized_delta = realized_after - realized_before;

        self.sink.fill(fill).await;

        // Closed-trade outcome feeds the losing-streak trigger.
        if !realized_delta.is_zero() {
            let transition = self.breaker.lock().record_trade_result(realized_delta);
            if let Some(transition) = transition {
                self.persist_breaker_transition(&transition).await?;
            }
        }
        self.evaluate_daily_loss().await
    }

    /// Reconciler drift report: classify, maybe escalate, always publish.
    pub async fn on_drift(&self, event: DriftEvent) -> Result<(), MotorError> {
        let class = self.drift.lock().classify(&event);
        self.sink.drift(event.clone()).await;
        if class == DriftClass::Persistent {
            warn!(symbol = %event.symbol, "Persistent drift; escalating breaker");
            let transition = self.breaker.lock().drift_detected();
            if let Some(transition) = transition {
                self.persist_breaker_transition(&transition).await?;
            }
        }
        Ok(())
    }

    /// Record a bus reconnect for the anomaly counters.
    pub async fn on_reconnect(&self) -> Result<(), MotorError> {
        let now = self.time.now_ms();
        let anomalous = self.drift.lock().record_reconnect(now);
        if anomalous {
            let transition = self.breaker.lock().security_anomaly(0);
            if let Some(transition) = transition {
                self.persist_breaker_transition(&transition).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // EMERGENCY FLATTEN
    // =========================================================================

    /// Bounded best-effort close of every open shadow position with market
    /// orders, each capped at the policy's per-order notional.
    pub(crate) async fn flatten_all(&self) -> Result<(), MotorError> {
        let cap = self.policy.breaker.emergency_order_notional_cap;
        let positions = self.book.open_positions().await;
        let mut remaining = 0usize;

        for position in positions {
            let side = Side::closing(position.size);
            let mark = match self.exchange.mark_price(&position.symbol).await {
                Ok(mark) if !mark.is_zero() => mark,
                _ => position.avg_entry_price.max(Decimal::ONE),
            };
            let slice_qty = (cap / mark).max(Decimal::new(1, 8));
            let mut left = position.size.abs();
            let mut slices = 0;

            // Bounded attempt: at most 16 slices per position.
            while left > Decimal::ZERO && slices < 16 {
                let qty = left.min(slice_qty);
                let request = OrderRequest {
                    idempotency_key: uuid::Uuid::new_v4(),
                    symbol: position.symbol.clone(),
                    side,
                    order_type: OrderType::Market,
                    quantity: qty,
                    limit_price: None,
                    stop_loss: None,
                    take_profit: None,
                    leverage: 1,
                    client_order_tag: "emergency-flatten".to_string(),
                };
                match self.exchange.place_order(&request).await {
                    Ok(ack) => {
                        self.book.apply_ack(&position.symbol, side, qty).await;
                        info!(
                            symbol = %position.symbol,
                            order_id = %ack.order_id,
                            qty = %qty,
                            "Flatten slice placed"
                        );
                        left -= qty;
                    }
                    Err(e) => {
                        warn!(symbol = %position.symbol, error = %e, "Flatten slice failed");
                        break;
                    }
                }
                slices += 1;
            }
            if left > Decimal::ZERO {
                remaining += 1;
            }
        }

        if remaining > 0 {
            // Positions that would not close stay for the reconciler and
            // the operator; flatten never loops forever.
            error!(remaining, "Flatten-all left positions open");
            return Err(MotorError::FlattenIncomplete(remaining));
        }
        Ok(())
    }

    // =========================================================================
    // BUS CONSUMPTION
    // =========================================================================

    /// Dispatch one command-stream message.
    pub async fn handle_command_message(&self, message: &StreamMessage) {
        if message.subject.starts_with(subjects::PLACE_INTENT_PREFIX) {
            self.process_raw_intent(&message.payload).await;
        } else if message.subject == subjects::SYS_HALT
            || message.subject == subjects::OPERATOR_ARM
            || message.subject == subjects::OPERATOR_DISARM
            || message.subject == subjects::OPERATOR_DEESCALATE
        {
            match message.decode::<OperatorCommand>() {
                Ok(command) => {
                    if let Err(e) = self.handle_operator_command(&command).await {
                        warn!(subject = %message.subject, error = %e, "Operator command refused");
                    }
                }
                Err(e) => warn!(subject = %message.subject, error = %e, "Operator command unparseable"),
            }
        } else {
            warn!(subject = %message.subject, "Unexpected command subject");
        }
    }

    /// Consume the command stream until it closes or shutdown fires.
    pub async fn run(
        &self,
        mut subscription: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Motor command loop shutting down");
                        return;
                    }
                }
                message = subscription.recv() => {
                    let Some(message) = message else {
                        info!("Command stream closed");
                        return;
                    };
                    self.handle_command_message(&message).await;
                    if let Err(e) = subscription.ack(&message) {
                        warn!(error = %e, "Cursor commit failed");
                    }
                }
            }
        }
    }
}
