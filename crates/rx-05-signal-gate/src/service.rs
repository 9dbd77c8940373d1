//! Signal gate service.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use rx_02_leader_elector::{ElectorHandle, TermStore};
use shared_bus::{subjects, BusError, Identity, MessageBus, StreamMessage, Subscription};
use shared_types::{
    CanonicalPolicy, IntentEnvelope, IntentPayload, PolicyAdvertisedEvent, PolicyHash, SignalEvent,
};

use crate::approval::{ApprovalChain, ApprovalPorts, FlowValidator, RegimeGate, StrategyRegistry};
use crate::dedup::DedupStore;

/// Gate failures.
#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Dedup store: {0}")]
    Dedup(String),

    #[error("Nonce store: {0}")]
    NonceStore(String),

    #[error("Envelope construction: {0}")]
    Envelope(String),
}

/// What the gate did with one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Intent published on the commands stream.
    Emitted,
    /// Not the leader; signal left for the leader.
    NotLeader,
    /// Handshake red: no matching policy advertisement seen yet.
    PolicyNotSynced,
    /// Seen this `signal_id` before.
    Duplicate,
    /// Approval chain refused, with the first reason.
    Refused(String),
}

/// Constructor dependencies, bundled to keep the signature flat.
pub struct SignalGateDependencies<R, F, G>
where
    R: StrategyRegistry,
    F: FlowValidator,
    G: RegimeGate,
{
    pub bus: Arc<MessageBus>,
    pub identity: Identity,
    pub elector: ElectorHandle,
    pub policy: Arc<CanonicalPolicy>,
    pub dedup: Arc<dyn DedupStore>,
    /// Persistent monotonic counter for envelope nonces.
    pub nonce_store: Arc<dyn TermStore>,
    pub ports: ApprovalPorts<R, F, G>,
    /// Shared secret this issuer signs envelopes with.
    pub issuer_secret: Vec<u8>,
    /// Cortex-side estimate of account equity for the cheap exposure check.
    pub equity: Decimal,
}

/// The gate.
pub struct SignalGate<R, F, G>
where
    R: StrategyRegistry,
    F: FlowValidator,
    G: RegimeGate,
{
    bus: Arc<MessageBus>,
    identity: Identity,
    elector: ElectorHandle,
    policy: Arc<CanonicalPolicy>,
    policy_hash: PolicyHash,
    dedup: Arc<dyn DedupStore>,
    nonce_store: Arc<dyn TermStore>,
    ports: ApprovalPorts<R, F, G>,
    issuer_secret: Vec<u8>,
    equity: Decimal,
    /// Green once a policy advertisement matching our hash is observed.
    policy_synced: Mutex<bool>,
    /// Gross notional emitted this session (cheap exposure estimate).
    emitted_exposure: Mutex<Decimal>,
}

impl<R, F, G> SignalGate<R, F, G>
where
    R: StrategyRegistry,
    F: FlowValidator,
    G: RegimeGate,
{
    /// Build the gate. Starts un-synced: no intents until the handshake.
    #[must_use]
    pub fn new(deps: SignalGateDependencies<R, F, G>) -> Self {
        let policy_hash = deps.policy.hash();
        Self {
            bus: deps.bus,
            identity: deps.identity,
            elector: deps.elector,
            policy: deps.policy,
            policy_hash,
            dedup: deps.dedup,
            nonce_store: deps.nonce_store,
            ports: deps.ports,
            issuer_secret: deps.issuer_secret,
            equity: deps.equity,
            policy_synced: Mutex::new(false),
            emitted_exposure: Mutex::new(Decimal::ZERO),
        }
    }

    /// The hash this gate compiled against.
    #[must_use]
    pub fn policy_hash(&self) -> PolicyHash {
        self.policy_hash
    }

    /// Whether the handshake is green.
    #[must_use]
    pub fn is_policy_synced(&self) -> bool {
        *self.policy_synced.lock()
    }

    /// Feed a Motor policy advertisement into the handshake.
    pub fn observe_policy_ad(&self, ad: &PolicyAdvertisedEvent) {
        if ad.policy_hash == self.policy_hash {
            let mut synced = self.policy_synced.lock();
            if !*synced {
                info!(hash = %ad.policy_hash, "Policy handshake green");
            }
            *synced = true;
        } else {
            // Stale deployment on one side. Stop emitting and say so loudly;
            // the Motor would reject our intents anyway.
            *self.policy_synced.lock() = false;
            error!(
                ours = %self.policy_hash,
                theirs = %ad.policy_hash,
                "POLICY HASH MISMATCH - intent emission suspended"
            );
        }
    }

    /// Promotion resets the handshake; the new leader must observe a
    /// matching advertisement before its first intent.
    pub fn on_promotion(&self) {
        *self.policy_synced.lock() = false;
    }

    /// Judge one signal and, on approval, publish the signed intent.
    pub async fn handle_signal(
        &self,
        signal: &SignalEvent,
        now_ms: i64,
    ) -> Result<SignalOutcome, GateError> {
        let Some(term) = self.elector.current_term() else {
            debug!(signal_id = %signal.signal_id, "Not leader; ignoring signal");
            return Ok(SignalOutcome::NotLeader);
        };

        if !self.is_policy_synced() {
            warn!(signal_id = %signal.signal_id, "Handshake not green; signal dropped");
            return Ok(SignalOutcome::PolicyNotSynced);
        }

        let fresh = self
            .dedup
            .check_and_record(&signal.signal_id, now_ms)
            .map_err(|e| GateError::Dedup(e.to_string()))?;
        if !fresh {
            debug!(signal_id = %signal.signal_id, "Duplicate signal");
            return Ok(SignalOutcome::Duplicate);
        }

        let exposure = *self.emitted_exposure.lock();
        if let Err(reason) =
            ApprovalChain::approve(&self.policy, &self.ports, signal, exposure, self.equity)
        {
            info!(signal_id = %signal.signal_id, reason, "Signal refused");
            return Ok(SignalOutcome::Refused(reason));
        }

        let payload = IntentPayload {
            intent_id: uuid::Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: match signal.limit_price {
                Some(_) => shared_types::OrderType::Limit,
                None => shared_types::OrderType::Market,
            },
            quantity: signal.quantity,
            limit_price: signal.limit_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            leverage: signal.leverage,
            client_order_tag: signal.signal_id.clone(),
        };

        // Persistent monotonic nonce: load, increment, store durably
        // before the envelope leaves this process.
        let nonce = self
            .nonce_store
            .load()
            .map_err(|e| GateError::NonceStore(e.to_string()))?
            + 1;
        self.nonce_store
            .store(nonce)
            .map_err(|e| GateError::NonceStore(e.to_string()))?;

        let envelope = IntentEnvelope::signed(
            payload,
            self.policy_hash,
            self.elector.candidate_id().to_string(),
            term,
            now_ms,
            nonce,
            &self.issuer_secret,
        )
        .map_err(|e| GateError::Envelope(e.to_string()))?;

        let subject = subjects::place_intent(&signal.symbol);
        self.bus
            .publish_json(&self.identity, &subject, &envelope)
            .await?;

        if let Some(price) = signal.limit_price {
            *self.emitted_exposure.lock() += (signal.quantity * price).abs();
        }
        info!(
            signal_id = %signal.signal_id,
            intent_id = %envelope.payload.intent_id,
            nonce,
            term,
            "Intent emitted"
        );
        Ok(SignalOutcome::Emitted)
    }

    /// Consume signals and policy advertisements until shutdown.
    ///
    /// Two subscriptions, one loop: the handshake state must be updated in
    /// program order with signal handling or a stale hash could race a
    /// fresh signal.
    pub async fn run(
        &self,
        mut signals: Subscription,
        mut policy_ads: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut leadership = self.elector.watch();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Signal gate shutting down");
                        return;
                    }
                }
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if leadership.borrow().is_leader() {
                        self.on_promotion();
                        info!("Promoted; awaiting policy handshake");
                    }
                }
                message = policy_ads.recv() => {
                    let Some(message) = message else { return };
                    if let Ok(ad) = message.decode::<PolicyAdvertisedEvent>() {
                        self.observe_policy_ad(&ad);
                    }
                    let _ = policy_ads.ack(&message);
                }
                message = signals.recv() => {
                    let Some(message) = message else { return };
                    self.handle_signal_message(&message).await;
                    let _ = signals.ack(&message);
                }
            }
        }
    }

    async fn handle_signal_message(&self, message: &StreamMessage) {
        match message.decode::<SignalEvent>() {
            Ok(signal) => {
                if let Err(e) = self.handle_signal(&signal, shared_types::now_ms()).await {
                    warn!(subject = %message.subject, error = %e, "Signal handling failed");
                }
            }
            Err(e) => warn!(subject = %message.subject, error = %e, "Unparseable signal"),
        }
    }
}
