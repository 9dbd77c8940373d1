//! The in-process message bus.
//!
//! One `MessageBus` instance backs a whole deployment in tests and
//! single-host runs; the contract (streams, ACLs, cursors, at-least-once) is
//! what the rest of the system programs against, so a networked transport
//! can replace this implementation without touching any consumer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::acl::{AclMatrix, Identity};
use crate::cursor::CursorStore;
use crate::stream::{Stream, StreamLog, StreamMessage};
use crate::subscriber::Subscription;
use crate::subjects;
use crate::{DEFAULT_PREFETCH, DEFAULT_RETENTION};

/// Bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The identity holds no grant covering the subject.
    #[error("Identity {identity} not authorized for subject {subject}")]
    NotAuthorized { identity: String, subject: String },

    /// The transport is down. Leaders demote on this.
    #[error("Bus disconnected")]
    Disconnected,

    /// Durable cursor store failure.
    #[error("Cursor store: {0}")]
    CursorStore(String),

    /// Payload could not be serialized.
    #[error("Payload not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Object-safe publish surface; subsystem adapters depend on this rather
/// than the concrete bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish raw bytes on a subject. Returns the assigned sequence.
    async fn publish(
        &self,
        identity: &Identity,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError>;
}

/// A message that could not be processed, parked on the dead-letter subject
/// with the original payload intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_subject: String,
    pub original_payload: Vec<u8>,
    pub reason: String,
    pub timestamp: i64,
}

struct SubscriberHandle {
    prefix: String,
    sender: mpsc::Sender<StreamMessage>,
}

struct BusState {
    logs: HashMap<Stream, StreamLog>,
    subscribers: Vec<SubscriberHandle>,
}

/// Subject-addressed streamed transport with ACLs and replay.
pub struct MessageBus {
    acl: AclMatrix,
    state: Mutex<BusState>,
    connected_tx: watch::Sender<bool>,
    cursor_store: Arc<dyn CursorStore>,
}

impl MessageBus {
    /// Create a bus with the given ACL matrix and cursor store.
    #[must_use]
    pub fn new(acl: AclMatrix, cursor_store: Arc<dyn CursorStore>) -> Self {
        let mut logs = HashMap::new();
        logs.insert(Stream::Commands, StreamLog::new(DEFAULT_RETENTION));
        logs.insert(Stream::Events, StreamLog::new(DEFAULT_RETENTION));
        logs.insert(Stream::Data, StreamLog::new(DEFAULT_RETENTION));
        let (connected_tx, _) = watch::channel(true);
        Self {
            acl,
            state: Mutex::new(BusState {
                logs,
                subscribers: Vec::new(),
            }),
            connected_tx,
            cursor_store,
        }
    }

    /// Observe transport connectivity. `false` means disconnected; any
    /// leader watching this must demote immediately.
    #[must_use]
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Drop or restore the transport (test and failover hook).
    pub fn set_connected(&self, connected: bool) {
        self.connected_tx.send_replace(connected);
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Publish a JSON-serializable value.
    pub async fn publish_json<T: Serialize>(
        &self,
        identity: &Identity,
        subject: &str,
        value: &T,
    ) -> Result<u64, BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(identity, subject, payload).await
    }

    /// Park an unprocessable message on the dead-letter subject.
    pub async fn publish_dead_letter(
        &self,
        identity: &Identity,
        original: &StreamMessage,
        reason: &str,
        timestamp: i64,
    ) -> Result<u64, BusError> {
        let letter = DeadLetter {
            original_subject: original.subject.clone(),
            original_payload: original.payload.clone(),
            reason: reason.to_string(),
            timestamp,
        };
        warn!(subject = %original.subject, reason, "Message dead-lettered");
        self.publish_json(identity, subjects::LEDGER_DLQ, &letter).await
    }

    /// Subscribe `consumer` (under `identity`) to subjects matching
    /// `prefix`, resuming from its durable cursor.
    ///
    /// Retained messages after the cursor are replayed first; live messages
    /// follow, deduplicated by sequence across the seam.
    pub fn subscribe(
        &self,
        identity: &Identity,
        consumer: &str,
        prefix: &str,
    ) -> Result<Subscription, BusError> {
        self.subscribe_with_prefetch(identity, consumer, prefix, DEFAULT_PREFETCH)
    }

    /// [`Self::subscribe`] with an explicit prefetch window.
    pub fn subscribe_with_prefetch(
        &self,
        identity: &Identity,
        consumer: &str,
        prefix: &str,
        prefetch: usize,
    ) -> Result<Subscription, BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        if !self.acl.can_subscribe(identity, prefix) {
            return Err(BusError::NotAuthorized {
                identity: identity.0.clone(),
                subject: prefix.to_string(),
            });
        }

        let stream = Stream::of_subject(prefix);
        let cursor = self.cursor_store.load(consumer, stream)?;
        let (sender, receiver) = mpsc::channel(prefetch.max(1));

        // Registration and replay snapshot happen under one lock so a
        // concurrent publish lands in exactly one of the two paths.
        let replay: Vec<StreamMessage> = {
            let mut state = self.state.lock();
            state.subscribers.push(SubscriberHandle {
                prefix: prefix.to_string(),
                sender,
            });
            state
                .logs
                .get(&stream)
                .map(|log| {
                    log.replay_after(cursor)
                        .into_iter()
                        .filter(|m| subjects::matches(prefix, &m.subject))
                        .collect()
                })
                .unwrap_or_default()
        };

        debug!(consumer, prefix, cursor, replayed = replay.len(), "Subscription created");
        Ok(Subscription::new(
            consumer.to_string(),
            stream,
            replay,
            receiver,
            cursor,
            Arc::clone(&self.cursor_store),
        ))
    }
}

#[async_trait]
impl BusPublisher for MessageBus {
    async fn publish(
        &self,
        identity: &Identity,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        if !self.acl.can_publish(identity, subject) {
            warn!(identity = %identity, subject, "Publish denied by ACL");
            return Err(BusError::NotAuthorized {
                identity: identity.0.clone(),
                subject: subject.to_string(),
            });
        }

        let stream = Stream::of_subject(subject);
        let published_at = shared_types::now_ms();

        // Append and snapshot matching senders under the lock, deliver after
        // releasing it (delivery awaits on bounded channels).
        let (message, senders): (StreamMessage, Vec<mpsc::Sender<StreamMessage>>) = {
            let mut state = self.state.lock();
            let log = state.logs.get_mut(&stream).expect("all streams exist");
            let message = log.append(stream, subject, identity, published_at, payload);
            // Drop subscribers whose receivers are gone.
            state.subscribers.retain(|s| !s.sender.is_closed());
            let senders = state
                .subscribers
                .iter()
                .filter(|s| subjects::matches(&s.prefix, subject))
                .map(|s| s.sender.clone())
                .collect();
            (message, senders)
        };

        for sender in senders {
            // Bounded send: a full prefetch window suspends delivery here.
            if sender.send(message.clone()).await.is_err() {
                // Receiver dropped mid-delivery; cleaned up on next publish.
            }
        }

        debug!(subject, sequence = message.sequence, "Published");
        Ok(message.sequence)
    }
}
