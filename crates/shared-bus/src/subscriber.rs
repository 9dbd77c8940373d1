//! Subscriptions.
//!
//! A subscription is an iterator-of-messages pulled by its consumer task:
//! replayed backlog first, then live delivery, deduplicated by sequence at
//! the seam. There are no callbacks and no shared listener table.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cursor::CursorStore;
use crate::publisher::BusError;
use crate::stream::{Stream, StreamMessage};

/// A consumer's handle on one subject prefix.
///
/// Dropping the subscription detaches it from the bus; the durable cursor
/// keeps its position for the next connect.
pub struct Subscription {
    consumer: String,
    stream: Stream,
    replay: VecDeque<StreamMessage>,
    live: mpsc::Receiver<StreamMessage>,
    /// Highest sequence handed to the consumer.
    last_delivered: u64,
    cursor_store: Arc<dyn CursorStore>,
}

impl Subscription {
    pub(crate) fn new(
        consumer: String,
        stream: Stream,
        replay: Vec<StreamMessage>,
        live: mpsc::Receiver<StreamMessage>,
        cursor: u64,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            consumer,
            stream,
            replay: replay.into(),
            live,
            last_delivered: cursor,
            cursor_store,
        }
    }

    /// Next message, or `None` when the bus side is gone.
    ///
    /// At-least-once: a message received but never [`Self::ack`]ed is
    /// redelivered on the next connect.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        while let Some(msg) = self.replay.pop_front() {
            if msg.sequence > self.last_delivered {
                self.last_delivered = msg.sequence;
                return Some(msg);
            }
        }
        loop {
            let msg = self.live.recv().await?;
            // Live copies of messages already replayed are dropped here.
            if msg.sequence > self.last_delivered {
                self.last_delivered = msg.sequence;
                return Some(msg);
            }
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        while let Some(msg) = self.replay.pop_front() {
            if msg.sequence > self.last_delivered {
                self.last_delivered = msg.sequence;
                return Some(msg);
            }
        }
        loop {
            match self.live.try_recv() {
                Ok(msg) if msg.sequence > self.last_delivered => {
                    self.last_delivered = msg.sequence;
                    return Some(msg);
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Mark a message fully processed, committing the durable cursor.
    ///
    /// Consumers with transactional side effects (the ledger) call this only
    /// after their transaction commits.
    pub fn ack(&self, message: &StreamMessage) -> Result<(), BusError> {
        self.cursor_store
            .commit(&self.consumer, self.stream, message.sequence)
    }

    /// The consumer name this subscription tracks its cursor under.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}
