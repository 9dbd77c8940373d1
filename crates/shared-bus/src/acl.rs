//! Per-identity subject ACLs.
//!
//! Every process connects to the bus under one identity, and that identity's
//! grants are the only thing that lets it publish or subscribe on a subject.
//! No explicit grant means no access; there is no wildcard identity.

use std::collections::HashMap;

use crate::subjects;

/// A bus identity (process, not host). The Motor, each brain replica, the
/// operator console, and each strategy engine connect under distinct names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl Identity {
    /// Convenience constructor.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
struct Grants {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

/// Subject-prefix grants per identity.
///
/// Prefix semantics follow [`subjects::matches`]: dot-terminated stems match
/// a subtree, anything else matches exactly one subject.
#[derive(Debug, Clone, Default)]
pub struct AclMatrix {
    grants: HashMap<Identity, Grants>,
}

impl AclMatrix {
    /// Empty matrix: nothing is allowed until granted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant publish rights on a subject prefix.
    pub fn allow_publish(&mut self, identity: &Identity, prefix: &str) -> &mut Self {
        self.grants
            .entry(identity.clone())
            .or_default()
            .publish
            .push(prefix.to_string());
        self
    }

    /// Grant subscribe rights on a subject prefix.
    pub fn allow_subscribe(&mut self, identity: &Identity, prefix: &str) -> &mut Self {
        self.grants
            .entry(identity.clone())
            .or_default()
            .subscribe
            .push(prefix.to_string());
        self
    }

    /// May `identity` publish on `subject`?
    #[must_use]
    pub fn can_publish(&self, identity: &Identity, subject: &str) -> bool {
        self.grants
            .get(identity)
            .map(|g| g.publish.iter().any(|p| subjects::matches(p, subject)))
            .unwrap_or(false)
    }

    /// May `identity` subscribe to subjects under `prefix`?
    ///
    /// The requested prefix must fall entirely inside some grant: a grant of
    /// `reflex.evt.` covers a subscription to `reflex.evt.signal.`, never the
    /// other way around.
    #[must_use]
    pub fn can_subscribe(&self, identity: &Identity, prefix: &str) -> bool {
        let Some(grants) = self.grants.get(identity) else {
            return false;
        };
        grants.subscribe.iter().any(|g| {
            if g.ends_with('.') {
                prefix.starts_with(g.as_str()) || subjects::matches(g, prefix)
            } else {
                g == prefix
            }
        })
    }

    /// The standard grant table for a Reflex deployment.
    ///
    /// | Identity | Publishes | Subscribes |
    /// |----------|-----------|------------|
    /// | motor | `evt.execution.*`, `evt.exec.*`, `evt.ledger.*` | `cmd.*` |
    /// | brain replicas | `cmd.execution.*`, `evt.ledger.*` (dead letters), `sys.lease` | `evt.*`, `sys.lease` |
    /// | operator | `cmd.operator.*`, `cmd.sys.*` | `evt.*` |
    /// | strategies | `evt.signal.*` | `data.*` |
    #[must_use]
    pub fn reflex_default(
        motor: &Identity,
        brains: &[Identity],
        operator: &Identity,
        strategies: &[Identity],
    ) -> Self {
        let mut acl = Self::new();
        acl.allow_publish(motor, "reflex.evt.execution.")
            .allow_publish(motor, "reflex.evt.exec.")
            .allow_publish(motor, "reflex.evt.ledger.")
            .allow_subscribe(motor, "reflex.cmd.");
        for brain in brains {
            acl.allow_publish(brain, "reflex.cmd.execution.")
                .allow_publish(brain, "reflex.evt.ledger.")
                .allow_publish(brain, subjects::SYS_LEASE)
                .allow_subscribe(brain, "reflex.evt.")
                .allow_subscribe(brain, subjects::SYS_LEASE);
        }
        acl.allow_publish(operator, "reflex.cmd.operator.")
            .allow_publish(operator, "reflex.cmd.sys.")
            .allow_subscribe(operator, "reflex.evt.");
        for strategy in strategies {
            acl.allow_publish(strategy, "reflex.evt.signal.")
                .allow_subscribe(strategy, "reflex.data.");
        }
        acl
    }
}
