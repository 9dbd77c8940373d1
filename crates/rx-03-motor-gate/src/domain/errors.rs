//! Motor error types.

use shared_types::ArmedState;
use thiserror::Error;

/// Motor failures that are not intent rejections. Intent rejections are not
/// errors; they are outcomes, carried by `RejectionEvent`.
#[derive(Debug, Error)]
pub enum MotorError {
    /// Invalid armed-state transition request.
    #[error("Cannot {action} from {from}")]
    InvalidTransition { from: ArmedState, action: String },

    /// Durable state store failure. Fatal: the interlock must never
    /// acknowledge a transition it could not persist.
    #[error("State store: {0}")]
    StateStore(String),

    /// Operator command failed verification.
    #[error("Operator command rejected: {0}")]
    OperatorRejected(String),

    /// Bus failure while emitting an event.
    #[error("Bus: {0}")]
    Bus(String),

    /// Flatten-all could not complete within its bounded attempt.
    #[error("Flatten incomplete: {0} positions remain")]
    FlattenIncomplete(usize),
}
