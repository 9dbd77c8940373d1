//! The arm/disarm interlock.
//!
//! A pure transition table over [`ArmedState`]. Persistence and event
//! emission belong to the service; this module only answers "is this
//! transition legal, and what does it produce".

use shared_types::{ArmedState, OperatorAction};

use crate::domain::errors::MotorError;

/// Validates interlock transitions.
pub struct ArmedInterlock;

impl ArmedInterlock {
    /// The state an operator action moves the interlock to.
    ///
    /// Legal transitions:
    /// - `Disarmed -> Armed` (arm)
    /// - `Armed -> Disarmed` (disarm)
    /// - any state `-> Halted` (halt)
    ///
    /// Re-asserting the current state is a no-op, not an error; writing the
    /// same value twice must be idempotent. Arming from `Halted` is refused:
    /// a halt must be resolved through disarm first.
    pub fn transition(
        current: ArmedState,
        action: OperatorAction,
    ) -> Result<ArmedState, MotorError> {
        let target = match action {
            OperatorAction::Arm => ArmedState::Armed,
            OperatorAction::Disarm => ArmedState::Disarmed,
            OperatorAction::Halt => ArmedState::Halted,
            OperatorAction::BreakerDeescalate => {
                return Err(MotorError::InvalidTransition {
                    from: current,
                    action: "breaker_deescalate (not an interlock action)".to_string(),
                })
            }
        };

        if target == current {
            return Ok(current);
        }

        match (current, target) {
            (ArmedState::Disarmed, ArmedState::Armed)
            | (ArmedState::Armed, ArmedState::Disarmed)
            | (_, ArmedState::Halted)
            | (ArmedState::Halted, ArmedState::Disarmed) => Ok(target),
            (from, _) => Err(MotorError::InvalidTransition {
                from,
                action: action.to_string(),
            }),
        }
    }
}
