//! Pure election state machine.
//!
//! All time flows in through arguments, so every transition is unit-testable
//! without a runtime.

use serde::{Deserialize, Serialize};

/// A lease claim on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHeartbeat {
    pub candidate_id: String,
    pub term: u64,
    /// Milliseconds since epoch at send time.
    pub sent_at: i64,
}

/// Current role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Follower,
    Leader { term: u64 },
}

impl Leadership {
    /// Whether this side currently holds the lease.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Leadership::Leader { .. })
    }
}

/// What the caller must do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing due.
    None,
    /// Publish this heartbeat (renewal or fresh claim).
    Heartbeat(LeaseHeartbeat),
}

/// The last claim observed from any peer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedClaim {
    candidate_id: String,
    term: u64,
    observed_at: i64,
}

/// Election state machine for one candidate.
///
/// Claim ordering: higher term wins; equal terms tie-break toward the
/// lexicographically smaller candidate id. A candidate only claims once the
/// incumbent lease has expired, and always claims with a term strictly above
/// every term it has ever observed.
pub struct LeaseMachine {
    candidate_id: String,
    lease_ms: i64,
    /// Highest term ever observed or used; promotions go one above this.
    highest_term: u64,
    leadership: Leadership,
    last_peer_claim: Option<ObservedClaim>,
    last_heartbeat_sent: i64,
}

impl LeaseMachine {
    /// Create a follower. `initial_term` is the persisted highest term from
    /// previous runs.
    #[must_use]
    pub fn new(candidate_id: &str, lease_ms: i64, initial_term: u64) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            lease_ms,
            highest_term: initial_term,
            leadership: Leadership::Follower,
            last_peer_claim: None,
            last_heartbeat_sent: 0,
        }
    }

    /// Current role.
    #[must_use]
    pub fn leadership(&self) -> Leadership {
        self.leadership
    }

    /// Highest term this machine has seen or used.
    #[must_use]
    pub fn highest_term(&self) -> u64 {
        self.highest_term
    }

    /// Whether `claim` beats `incumbent` in the protocol's total order.
    fn outranks(claim: (u64, &str), incumbent: (u64, &str)) -> bool {
        claim.0 > incumbent.0 || (claim.0 == incumbent.0 && claim.1 < incumbent.1)
    }

    /// Feed a heartbeat observed on the lease subject.
    ///
    /// Returns `true` if this observation demoted us.
    pub fn observe(&mut self, heartbeat: &LeaseHeartbeat, now: i64) -> bool {
        self.highest_term = self.highest_term.max(heartbeat.term);
        if heartbeat.candidate_id == self.candidate_id {
            return false;
        }
        self.last_peer_claim = Some(ObservedClaim {
            candidate_id: heartbeat.candidate_id.clone(),
            term: heartbeat.term,
            observed_at: now,
        });

        if let Leadership::Leader { term } = self.leadership {
            if Self::outranks(
                (heartbeat.term, heartbeat.candidate_id.as_str()),
                (term, self.candidate_id.as_str()),
            ) {
                self.leadership = Leadership::Follower;
                return true;
            }
        }
        false
    }

    /// Advance time. Leaders renew; followers claim expired leases.
    pub fn tick(&mut self, now: i64) -> TickAction {
        match self.leadership {
            Leadership::Leader { term } => {
                if now - self.last_heartbeat_sent >= self.lease_ms / 3 {
                    self.last_heartbeat_sent = now;
                    TickAction::Heartbeat(LeaseHeartbeat {
                        candidate_id: self.candidate_id.clone(),
                        term,
                        sent_at: now,
                    })
                } else {
                    TickAction::None
                }
            }
            Leadership::Follower => {
                let incumbent_alive = self
                    .last_peer_claim
                    .as_ref()
                    .is_some_and(|claim| now - claim.observed_at < self.lease_ms);
                if incumbent_alive {
                    return TickAction::None;
                }
                // Lease is vacant or expired: claim it, one term above
                // everything ever observed.
                self.highest_term += 1;
                self.leadership = Leadership::Leader {
                    term: self.highest_term,
                };
                self.last_heartbeat_sent = now;
                TickAction::Heartbeat(LeaseHeartbeat {
                    candidate_id: self.candidate_id.clone(),
                    term: self.highest_term,
                    sent_at: now,
                })
            }
        }
    }

    /// Transport loss: immediate hard demotion.
    ///
    /// Returns `true` if we were leader.
    pub fn disconnect(&mut self) -> bool {
        let was_leader = self.leadership.is_leader();
        self.leadership = Leadership::Follower;
        // Forget the peer view; it is stale once the transport drops.
        self.last_peer_claim = None;
        was_leader
    }
}
