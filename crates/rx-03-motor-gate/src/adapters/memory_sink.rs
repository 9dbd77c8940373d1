//! Recording event sink for tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use shared_types::{
    AcceptedEvent, DriftEvent, FillEvent, PolicyAdvertisedEvent, RejectionEvent, StateChangeEvent,
};

use crate::ports::EventSink;

/// Captures every emitted event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub rejections: Mutex<Vec<RejectionEvent>>,
    pub accepted: Mutex<Vec<AcceptedEvent>>,
    pub fills: Mutex<Vec<FillEvent>>,
    pub state_changes: Mutex<Vec<StateChangeEvent>>,
    pub policy_ads: Mutex<Vec<PolicyAdvertisedEvent>>,
    pub drifts: Mutex<Vec<DriftEvent>>,
}

impl RecordingSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rejection reasons in emission order.
    #[must_use]
    pub fn reject_reasons(&self) -> Vec<shared_types::RejectReason> {
        self.rejections.lock().iter().map(|r| r.reason).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn rejection(&self, event: RejectionEvent) {
        self.rejections.lock().push(event);
    }

    async fn accepted(&self, event: AcceptedEvent) {
        self.accepted.lock().push(event);
    }

    async fn fill(&self, event: FillEvent) {
        self.fills.lock().push(event);
    }

    async fn state_change(&self, event: StateChangeEvent) {
        self.state_changes.lock().push(event);
    }

    async fn policy_advertised(&self, event: PolicyAdvertisedEvent) {
        self.policy_ads.lock().push(event);
    }

    async fn drift(&self, event: DriftEvent) {
        self.drifts.lock().push(event);
    }
}
