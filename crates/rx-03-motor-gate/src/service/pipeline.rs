//! Pipeline steps one through twelve.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_types::{
    AcceptedEvent, IntentEnvelope, IntentPayload, RejectReason, RejectionEvent,
    EXCHANGE_DEADLINE_MS, TIMESTAMP_WINDOW_MS,
};

use crate::domain::{RiskGuard, RiskInputs};
use crate::ports::{EventSink, ExchangeError, ExchangeGateway, KeyProvider, OrderAck, OrderRequest};

use super::MotorService;

/// What the pipeline did with one raw envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Accepted(AcceptedEvent),
    Rejected(RejectionEvent),
}

impl PipelineOutcome {
    /// The rejection reason, if rejected.
    #[must_use]
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            PipelineOutcome::Rejected(event) => Some(event.reason),
            PipelineOutcome::Accepted(_) => None,
        }
    }
}

/// Retry budget for transient exchange errors: 3 retries, exponential
/// backoff, capped at 1 s total.
const SUBMIT_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

impl<E, S, K> MotorService<E, S, K>
where
    E: ExchangeGateway,
    S: EventSink,
    K: KeyProvider,
{
    /// Run one raw envelope through the full gate.
    ///
    /// Emits exactly one event: the acceptance with the venue order id, or
    /// the first rejection hit. Nothing here panics on hostile bytes.
    pub async fn process_raw_intent(&self, raw: &[u8]) -> PipelineOutcome {
        let now = self.clock().now_ms();

        // ---- 1. Armed interlock ---------------------------------------
        // Before any parsing beyond the id: a malformed payload against a
        // disarmed Motor yields the same `system_disarmed` as a valid one.
        if !self.armed_state().allows_placement() {
            let intent_id = IntentEnvelope::extract_intent_id(raw);
            return self
                .reject(intent_id, None, RejectReason::SystemDisarmed, None, now)
                .await;
        }

        // ---- 2. Envelope parse & schema -------------------------------
        let envelope: IntentEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let intent_id = IntentEnvelope::extract_intent_id(raw);
                return self
                    .reject(
                        intent_id,
                        None,
                        RejectReason::Malformed,
                        Some(e.to_string()),
                        now,
                    )
                    .await;
            }
        };
        let intent_id = Some(envelope.payload.intent_id);
        let issuer = envelope.brain_instance_id.clone();
        if let Err(detail) = validate_shape(&envelope.payload) {
            return self
                .reject(intent_id, Some(&issuer), RejectReason::Malformed, Some(detail), now)
                .await;
        }

        // ---- 3. Timestamp skew ----------------------------------------
        // The window is inclusive: exactly +300_000 ms passes.
        if (now - envelope.issued_at).abs() > TIMESTAMP_WINDOW_MS {
            return self
                .reject(
                    intent_id,
                    Some(&issuer),
                    RejectReason::TimestampSkew,
                    Some(format!("issued_at {} vs now {now}", envelope.issued_at)),
                    now,
                )
                .await;
        }

        // ---- 4. HMAC verify -------------------------------------------
        // Unknown issuer fails closed: no secret, no valid MAC. The MAC
        // must be checked before the nonce is consumed, or forged
        // envelopes could burn a legitimate issuer's nonces.
        let verified = self
            .keys()
            .issuer_secret(&issuer)
            .is_some_and(|secret| envelope.verify(&secret).is_ok());
        if !verified {
            let anomalous = self.drift.lock().record_hmac_reject(now);
            if anomalous {
                let transition = self.breaker.lock().security_anomaly(0);
                if let Some(transition) = transition {
                    if let Err(e) = self.persist_breaker_transition(&transition).await {
                        warn!(error = %e, "Breaker persistence failed");
                    }
                }
            }
            return self
                .reject(intent_id, Some(&issuer), RejectReason::HmacInvalid, None, now)
                .await;
        }

        // ---- 5. Nonce replay / 6. Term monotonicity -------------------
        // The lock-acquiring block below must resolve to a plain value
        // before any `.await`: a parking_lot MutexGuard held across a
        // suspend point would make this future non-`Send`.
        let replay_outcome = {
            let mut replay = self.replay.lock();
            if let Err(e) = replay.check_nonce(&issuer, envelope.nonce, envelope.issued_at) {
                Err(e.to_string())
            } else if let Err(e) = replay.check_term(&issuer, envelope.leader_term) {
                // A fenced-out leader presents as a replay: its envelopes
                // are stale by construction.
                Err(e.to_string())
            } else {
                Ok(replay.snapshot())
            }
        };
        match replay_outcome {
            Err(detail) => {
                return self
                    .reject(
                        intent_id,
                        Some(&issuer),
                        RejectReason::NonceReplay,
                        Some(detail),
                        now,
                    )
                    .await;
            }
            Ok(snapshot) => {
                // Flush the high-water marks; in-memory state still guards
                // if this fails, so it does not reject the intent.
                if let Err(e) = self.state_store.store_replay(&snapshot) {
                    warn!(error = %e, "Replay snapshot flush failed");
                }
            }
        }

        // ---- 7. Policy hash -------------------------------------------
        if envelope.policy_hash != self.policy_hash() {
            return self
                .reject_with_hashes(intent_id, Some(&issuer), envelope.policy_hash, now)
                .await;
        }

        // ---- 8. Circuit breaker ---------------------------------------
        // As above: resolve the lock-guarded check to a plain value before
        // any `.await` so the guard never crosses a suspend point.
        let breaker_outcome = {
            let breaker = self.breaker.lock();
            if breaker.state().allows_new_orders() {
                Ok(breaker.state().size_multiplier())
            } else {
                let state = breaker.state();
                drop(breaker);
                Err(format!("breaker {state}"))
            }
        };
        let multiplier = match breaker_outcome {
            Ok(multiplier) => multiplier,
            Err(detail) => {
                return self
                    .reject(
                        intent_id,
                        Some(&issuer),
                        RejectReason::CircuitOpen,
                        Some(detail),
                        now,
                    )
                    .await;
            }
        };

        // ---- 9. Symbol & leverage whitelist ---------------------------
        let Some(symbol_policy) = self.policy().symbol(&envelope.payload.symbol) else {
            return self
                .reject(
                    intent_id,
                    Some(&issuer),
                    RejectReason::UnknownSymbol,
                    Some(envelope.payload.symbol.clone()),
                    now,
                )
                .await;
        };
        if envelope.payload.leverage > symbol_policy.max_leverage {
            return self
                .reject(
                    intent_id,
                    Some(&issuer),
                    RejectReason::RiskExceeded,
                    Some(format!(
                        "leverage {} exceeds {} for {}",
                        envelope.payload.leverage,
                        symbol_policy.max_leverage,
                        envelope.payload.symbol
                    )),
                    now,
                )
                .await;
        }

        // ---- 10. Rate limiter -----------------------------------------
        let acquired = self
            .limiter
            .lock()
            .try_acquire_at(&self.config().exchange, 1, now);
        if !acquired {
            return self
                .reject(intent_id, Some(&issuer), RejectReason::RateLimited, None, now)
                .await;
        }

        // ---- 11. Risk guard -------------------------------------------
        let inputs = match self.risk_inputs(&envelope.payload).await {
            Ok(inputs) => inputs,
            Err(detail) => {
                // No reference data means no basis to approve: fail closed.
                return self
                    .reject(
                        intent_id,
                        Some(&issuer),
                        RejectReason::RiskExceeded,
                        Some(detail),
                        now,
                    )
                    .await;
            }
        };
        if let Err(detail) = RiskGuard::check(self.policy(), &envelope.payload, multiplier, &inputs)
        {
            return self
                .reject(
                    intent_id,
                    Some(&issuer),
                    RejectReason::RiskExceeded,
                    Some(detail),
                    now,
                )
                .await;
        }

        // ---- 12. Exchange submit --------------------------------------
        let request = OrderRequest {
            idempotency_key: envelope.payload.intent_id,
            symbol: envelope.payload.symbol.clone(),
            side: envelope.payload.side,
            order_type: envelope.payload.order_type,
            quantity: envelope.payload.quantity,
            limit_price: envelope.payload.limit_price,
            stop_loss: envelope.payload.stop_loss,
            take_profit: envelope.payload.take_profit,
            leverage: envelope.payload.leverage,
            client_order_tag: envelope.payload.client_order_tag.clone(),
        };
        match self.submit_with_retry(&request).await {
            Ok(ack) => {
                self.book()
                    .apply_ack(&request.symbol, request.side, request.quantity)
                    .await;
                let event = AcceptedEvent {
                    intent_id: envelope.payload.intent_id,
                    order_id: ack.order_id,
                    symbol: request.symbol,
                    timestamp: self.clock().now_ms(),
                };
                info!(
                    intent_id = %event.intent_id,
                    order_id = %event.order_id,
                    "Intent accepted"
                );
                self.event_sink().accepted(event.clone()).await;
                PipelineOutcome::Accepted(event)
            }
            Err(error) => {
                let anomalous = self.drift.lock().record_exchange_reject(now);
                if anomalous {
                    let transition = self.breaker.lock().security_anomaly(0);
                    if let Some(transition) = transition {
                        if let Err(e) = self.persist_breaker_transition(&transition).await {
                            warn!(error = %e, "Breaker persistence failed");
                        }
                    }
                }
                let reason = match error {
                    // Venue 429: the local bucket should have prevented
                    // this, so it surfaces under the rate-limit taxonomy.
                    ExchangeError::RateLimited(_) => RejectReason::RateLimited,
                    _ => RejectReason::ExchangeRejected,
                };
                self.reject(intent_id, Some(&issuer), reason, Some(error.to_string()), now)
                    .await
            }
        }
    }

    /// Submit with the bounded retry policy for transient errors.
    async fn submit_with_retry(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let deadline = Duration::from_millis(EXCHANGE_DEADLINE_MS);
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(deadline, self.exchange_gateway().place_order(request))
                .await
                .unwrap_or_else(|_| {
                    Err(ExchangeError::Transient(format!(
                        "call exceeded {EXCHANGE_DEADLINE_MS} ms deadline"
                    )))
                });

            match result {
                Ok(ack) => return Ok(ack),
                Err(ExchangeError::Transient(detail)) if attempt < SUBMIT_RETRIES => {
                    attempt += 1;
                    let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
                    let jitter = rand::random::<u64>() % (backoff / 2 + 1);
                    debug!(attempt, backoff, detail, "Transient exchange error; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn risk_inputs(&self, payload: &IntentPayload) -> Result<RiskInputs, String> {
        let reference_price = match payload.limit_price {
            Some(price) => price,
            None => self
                .exchange_gateway()
                .mark_price(&payload.symbol)
                .await
                .map_err(|e| format!("no reference price: {e}"))?,
        };
        let account_equity = self
            .exchange_gateway()
            .account_equity(&self.config().account)
            .await
            .map_err(|e| format!("no account equity: {e}"))?;
        let symbol_committed_qty = self
            .book()
            .position(&payload.symbol)
            .await
            .map(|p| p.committed_qty())
            .unwrap_or(Decimal::ZERO);
        Ok(RiskInputs {
            reference_price,
            daily_realized_pnl: self.book().total_realized_pnl().await,
            gross_exposure: self.book().gross_exposure().await,
            symbol_committed_qty,
            account_equity,
        })
    }

    async fn reject(
        &self,
        intent_id: Option<Uuid>,
        issuer: Option<&str>,
        reason: RejectReason,
        detail: Option<String>,
        now: i64,
    ) -> PipelineOutcome {
        let event = RejectionEvent {
            intent_id,
            reason,
            detail,
            expected_policy_hash: None,
            got_policy_hash: None,
            brain_instance_id: issuer.map(str::to_string),
            timestamp: now,
        };
        self.finish_reject(event, now).await
    }

    async fn reject_with_hashes(
        &self,
        intent_id: Option<Uuid>,
        issuer: Option<&str>,
        got: shared_types::PolicyHash,
        now: i64,
    ) -> PipelineOutcome {
        let event = RejectionEvent {
            intent_id,
            reason: RejectReason::PolicyHashMismatch,
            detail: None,
            expected_policy_hash: Some(self.policy_hash()),
            got_policy_hash: Some(got),
            brain_instance_id: issuer.map(str::to_string),
            timestamp: now,
        };
        self.finish_reject(event, now).await
    }

    async fn finish_reject(&self, event: RejectionEvent, now: i64) -> PipelineOutcome {
        debug!(
            intent_id = ?event.intent_id,
            reason = %event.reason,
            detail = ?event.detail,
            "Intent rejected"
        );
        let transition = self.breaker.lock().record_reject(now);
        if let Some(transition) = transition {
            if let Err(e) = self.persist_breaker_transition(&transition).await {
                warn!(error = %e, "Breaker persistence failed");
            }
        }
        self.event_sink().rejection(event.clone()).await;
        PipelineOutcome::Rejected(event)
    }
}

/// Semantic shape checks beyond serde's structural ones.
fn validate_shape(payload: &IntentPayload) -> Result<(), String> {
    if payload.quantity <= Decimal::ZERO {
        return Err("quantity must be positive".to_string());
    }
    if payload.order_type.requires_limit_price() && payload.limit_price.is_none() {
        return Err(format!("{:?} order without limit price", payload.order_type));
    }
    if payload.leverage == 0 {
        return Err("leverage must be at least 1".to_string());
    }
    if payload.symbol.is_empty() {
        return Err("empty symbol".to_string());
    }
    Ok(())
}
