//! Subject names and prefix matching.
//!
//! Subjects are dot-separated and versioned. The `{symbol}` and `{phase}`
//! tails are filled by the builder functions; everything else is a constant.

/// Namespace prefix for every Reflex subject.
pub const NS: &str = "reflex";

/// Cortex -> Motor intent for one symbol.
#[must_use]
pub fn place_intent(symbol: &str) -> String {
    format!("{NS}.cmd.execution.place.v1.{symbol}")
}

/// Prefix matching every place-intent subject.
pub const PLACE_INTENT_PREFIX: &str = "reflex.cmd.execution.place.v1.";

/// Operator -> Motor emergency halt.
pub const SYS_HALT: &str = "reflex.cmd.sys.halt.v1";

/// Signed operator arm transition.
pub const OPERATOR_ARM: &str = "reflex.cmd.operator.arm.v1";

/// Signed operator disarm transition.
pub const OPERATOR_DISARM: &str = "reflex.cmd.operator.disarm.v1";

/// Signed operator breaker de-escalation.
pub const OPERATOR_DEESCALATE: &str = "reflex.cmd.operator.deescalate.v1";

/// Motor -> consumers: exchange fills.
pub const EXECUTION_FILL: &str = "reflex.evt.execution.fill.v1";

/// Motor -> consumers: intent rejections.
pub const EXEC_REJECT: &str = "reflex.evt.exec.reject.v1";

/// Motor -> consumers: intent acceptances.
pub const EXEC_ACCEPT: &str = "reflex.evt.exec.accept.v1";

/// Arm/disarm/breaker transitions.
pub const EXECUTION_STATE: &str = "reflex.evt.execution.state.v1";

/// Motor policy advertisement (hash handshake).
pub const EXECUTION_POLICY: &str = "reflex.evt.execution.policy.v1";

/// Reconciler drift reports.
pub const EXECUTION_DRIFT: &str = "reflex.evt.execution.drift.v1";

/// Ledger dead letters.
pub const LEDGER_DLQ: &str = "reflex.evt.ledger.dlq.v1";

/// Leader-election lease heartbeats.
pub const SYS_LEASE: &str = "reflex.sys.lease.v1";

/// Strategy -> Cortex signals for one phase.
#[must_use]
pub fn signal(phase: &str) -> String {
    format!("{NS}.evt.signal.{phase}.v1")
}

/// Prefix matching every signal subject.
pub const SIGNAL_PREFIX: &str = "reflex.evt.signal.";

/// Whether `subject` falls under `prefix`.
///
/// A prefix is either an exact subject or a dot-terminated stem; `reflex.cmd.`
/// matches every command subject, `reflex.cmd.sys.halt.v1` only itself.
#[must_use]
pub fn matches(prefix: &str, subject: &str) -> bool {
    if prefix.ends_with('.') {
        subject.starts_with(prefix)
    } else {
        subject == prefix
    }
}
