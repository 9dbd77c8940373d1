//! Elector service: drives the lease machine over the bus.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use shared_bus::{subjects, BusError, Identity, MessageBus};
use shared_types::LEASE_MS;

use crate::domain::{LeaseHeartbeat, LeaseMachine, Leadership, TickAction};
use crate::ports::{TermStore, TimeSource};

/// Elector failures.
#[derive(Debug, Error)]
pub enum ElectorError {
    /// Bus failure (disconnects are handled, this is anything else).
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Term persistence failure. Fatal: claiming without a durable term
    /// would risk reusing a fenced term after restart.
    #[error("Term store: {0}")]
    TermStore(String),
}

/// Read side of the elector: the current leadership and term.
#[derive(Clone)]
pub struct ElectorHandle {
    candidate_id: String,
    leadership: watch::Receiver<Leadership>,
}

impl ElectorHandle {
    /// This replica's candidate id (also its intent issuer id).
    #[must_use]
    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    /// Whether this replica currently holds the lease.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader()
    }

    /// Current term if leader.
    #[must_use]
    pub fn current_term(&self) -> Option<u64> {
        match *self.leadership.borrow() {
            Leadership::Leader { term } => Some(term),
            Leadership::Follower => None,
        }
    }

    /// Watch leadership transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Leadership> {
        self.leadership.clone()
    }
}

/// The elector service. `run` owns the loop; `handle` is the read side.
pub struct LeaderElector {
    identity: Identity,
    bus: Arc<MessageBus>,
    machine: LeaseMachine,
    term_store: Arc<dyn TermStore>,
    time: Arc<dyn TimeSource>,
    lease_ms: i64,
    leadership_tx: watch::Sender<Leadership>,
    leadership_rx: watch::Receiver<Leadership>,
}

impl LeaderElector {
    /// Create an elector for one brain replica.
    ///
    /// `candidate_id` doubles as the intent issuer id; `identity` is the bus
    /// identity the replica connects under (usually the same string).
    pub fn new(
        candidate_id: &str,
        identity: Identity,
        bus: Arc<MessageBus>,
        term_store: Arc<dyn TermStore>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, ElectorError> {
        Self::with_lease_ms(candidate_id, identity, bus, term_store, time, LEASE_MS as i64)
    }

    /// [`Self::new`] with a custom lease duration (test hook).
    pub fn with_lease_ms(
        candidate_id: &str,
        identity: Identity,
        bus: Arc<MessageBus>,
        term_store: Arc<dyn TermStore>,
        time: Arc<dyn TimeSource>,
        lease_ms: i64,
    ) -> Result<Self, ElectorError> {
        let initial_term = term_store.load()?;
        let machine = LeaseMachine::new(candidate_id, lease_ms, initial_term);
        let (leadership_tx, leadership_rx) = watch::channel(Leadership::Follower);
        Ok(Self {
            identity,
            bus,
            machine,
            term_store,
            time,
            lease_ms,
            leadership_tx,
            leadership_rx,
        })
    }

    /// Read side.
    #[must_use]
    pub fn handle(&self, candidate_id: &str) -> ElectorHandle {
        ElectorHandle {
            candidate_id: candidate_id.to_string(),
            leadership: self.leadership_rx.clone(),
        }
    }

    /// Drive the election until shutdown.
    ///
    /// The loop ticks at a sixth of the lease, observes peer heartbeats, and
    /// watches the bus connection; a disconnect demotes before anything else
    /// is processed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ElectorError> {
        let mut connection = self.bus.connection();
        let mut subscription = self
            .bus
            .subscribe(&self.identity, &format!("{}-lease", self.identity.0), subjects::SYS_LEASE)?;
        // First tick is delayed one period so a fresh subscription's replay
        // (the current lease view) is observed before any claim.
        let period = Duration::from_millis((self.lease_ms / 6).max(1) as u64);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(candidate = %self.identity, "Elector shutting down");
                        return Ok(());
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if !*connection.borrow() {
                        if self.machine.disconnect() {
                            warn!(candidate = %self.identity, "Bus disconnected; hard demotion");
                        }
                        self.publish_leadership();
                        // Wait out the outage, then resubscribe to rebuild
                        // the lease view.
                        while !*connection.borrow() {
                            if connection.changed().await.is_err() {
                                return Ok(());
                            }
                        }
                        subscription = self.bus.subscribe(
                            &self.identity,
                            &format!("{}-lease", self.identity.0),
                            subjects::SYS_LEASE,
                        )?;
                    }
                }
                message = subscription.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    if let Ok(heartbeat) = message.decode::<LeaseHeartbeat>() {
                        let now = self.time.now_ms();
                        if self.machine.observe(&heartbeat, now) {
                            info!(
                                candidate = %self.identity,
                                peer = %heartbeat.candidate_id,
                                peer_term = heartbeat.term,
                                "Demoted by superior claim"
                            );
                        }
                        self.publish_leadership();
                    }
                }
                _ = ticker.tick() => {
                    let now = self.time.now_ms();
                    let was_leader = self.machine.leadership().is_leader();
                    match self.machine.tick(now) {
                        TickAction::Heartbeat(heartbeat) => {
                            if !was_leader {
                                // Promotion: the term must be durable before
                                // the claim is visible to anyone.
                                self.term_store.store(heartbeat.term)?;
                                info!(
                                    candidate = %self.identity,
                                    term = heartbeat.term,
                                    "Promoted to leader"
                                );
                            }
                            match self.bus.publish_json(&self.identity, subjects::SYS_LEASE, &heartbeat).await {
                                Ok(_) => {}
                                Err(BusError::Disconnected) => {
                                    if self.machine.disconnect() {
                                        warn!(candidate = %self.identity, "Heartbeat failed; hard demotion");
                                    }
                                }
                                Err(e) => return Err(e.into()),
                            }
                            self.publish_leadership();
                        }
                        TickAction::None => {}
                    }
                }
            }
        }
    }

    fn publish_leadership(&self) {
        self.leadership_tx.send_replace(self.machine.leadership());
    }
}
