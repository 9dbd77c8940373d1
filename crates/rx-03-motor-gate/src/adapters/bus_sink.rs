//! Event sink over the message bus.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use shared_bus::{subjects, Identity, MessageBus};
use shared_types::{
    AcceptedEvent, DriftEvent, FillEvent, PolicyAdvertisedEvent, RejectionEvent, StateChangeEvent,
};

use crate::ports::EventSink;

/// Publishes Motor events onto their subjects under the Motor identity.
///
/// Event publication is best-effort relative to the pipeline: a bus outage
/// must not wedge order handling, so failures are logged and surfaced via
/// the reconnect counters, not propagated.
pub struct BusEventSink {
    bus: Arc<MessageBus>,
    identity: Identity,
}

impl BusEventSink {
    /// Sink publishing under the given identity.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>, identity: Identity) -> Self {
        Self { bus, identity }
    }

    async fn publish<T: serde::Serialize>(&self, subject: &str, event: &T) {
        if let Err(e) = self.bus.publish_json(&self.identity, subject, event).await {
            warn!(subject, error = %e, "Event publication failed");
        }
    }
}

#[async_trait]
impl EventSink for BusEventSink {
    async fn rejection(&self, event: RejectionEvent) {
        self.publish(subjects::EXEC_REJECT, &event).await;
    }

    async fn accepted(&self, event: AcceptedEvent) {
        self.publish(subjects::EXEC_ACCEPT, &event).await;
    }

    async fn fill(&self, event: FillEvent) {
        self.publish(subjects::EXECUTION_FILL, &event).await;
    }

    async fn state_change(&self, event: StateChangeEvent) {
        self.publish(subjects::EXECUTION_STATE, &event).await;
    }

    async fn policy_advertised(&self, event: PolicyAdvertisedEvent) {
        self.publish(subjects::EXECUTION_POLICY, &event).await;
    }

    async fn drift(&self, event: DriftEvent) {
        self.publish(subjects::EXECUTION_DRIFT, &event).await;
    }
}
