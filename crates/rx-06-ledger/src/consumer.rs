//! Bus consumer: fill events in, ledger transactions out, ack after commit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use shared_bus::{Identity, MessageBus, StreamMessage, Subscription};
use shared_types::FillEvent;

use crate::ports::KeyValueStore;
use crate::service::{Ledger, LedgerError};

/// Delay between redelivery attempts on transient store failure.
const RETRY_DELAY_MS: u64 = 200;

/// Consumes the fill subject and drives the ledger.
///
/// Acknowledgement discipline: the durable cursor moves only after the
/// ledger transaction commits. Transient failures retry in place (the
/// event is effectively redelivered); invariant violations go to the
/// dead-letter subject with the original payload and are then acked.
pub struct LedgerConsumer<S: KeyValueStore> {
    ledger: Arc<Ledger<S>>,
    bus: Arc<MessageBus>,
    identity: Identity,
}

impl<S: KeyValueStore> LedgerConsumer<S> {
    /// Consumer publishing dead letters under `identity`.
    #[must_use]
    pub fn new(ledger: Arc<Ledger<S>>, bus: Arc<MessageBus>, identity: Identity) -> Self {
        Self {
            ledger,
            bus,
            identity,
        }
    }

    /// Process one message to completion (commit, dead-letter, or shutdown).
    ///
    /// Returns `true` if the message may be acked.
    pub async fn process_message(
        &self,
        message: &StreamMessage,
        shutdown: &tokio::sync::watch::Receiver<bool>,
    ) -> bool {
        let fill: FillEvent = match message.decode() {
            Ok(fill) => fill,
            Err(e) => {
                // Not a fill at all: park it for investigation.
                let _ = self
                    .bus
                    .publish_dead_letter(
                        &self.identity,
                        message,
                        &format!("undecodable fill event: {e}"),
                        shared_types::now_ms(),
                    )
                    .await;
                return true;
            }
        };

        loop {
            match self.ledger.process_fill(&fill).await {
                Ok(outcome) => {
                    info!(fill_id = %fill.fill_id, ?outcome, "Fill handled");
                    return true;
                }
                Err(e) if e.is_transient() => {
                    if *shutdown.borrow() {
                        // Leave unacked; redelivered on next start.
                        return false;
                    }
                    warn!(fill_id = %fill.fill_id, error = %e, "Transient ledger failure; retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(LedgerError::Invariant(reason)) => {
                    let _ = self
                        .bus
                        .publish_dead_letter(
                            &self.identity,
                            message,
                            &reason,
                            shared_types::now_ms(),
                        )
                        .await;
                    return true;
                }
                Err(_) => unreachable!("non-transient errors are invariant violations"),
            }
        }
    }

    /// Consume until shutdown.
    pub async fn run(
        &self,
        mut subscription: Subscription,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Ledger consumer shutting down");
                        return;
                    }
                }
                message = subscription.recv() => {
                    let Some(message) = message else {
                        info!("Fill stream closed");
                        return;
                    };
                    if self.process_message(&message, &shutdown).await {
                        if let Err(e) = subscription.ack(&message) {
                            warn!(error = %e, "Cursor commit failed");
                        }
                    }
                }
            }
        }
    }
}
