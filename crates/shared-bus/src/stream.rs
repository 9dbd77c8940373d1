//! Persistent streams.
//!
//! Each stream is an append-only log of subject-tagged messages with a
//! monotonically increasing sequence. The log is the replay source for late
//! subscribers; live delivery rides on top of it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::acl::Identity;

/// The three persistent streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    /// Intents and operator commands.
    Commands,
    /// Fills, rejections, state changes, drift, signals.
    Events,
    /// Market data and lease heartbeats.
    Data,
}

impl Stream {
    /// Which stream a subject belongs to.
    #[must_use]
    pub fn of_subject(subject: &str) -> Stream {
        if subject.starts_with("reflex.cmd.") {
            Stream::Commands
        } else if subject.starts_with("reflex.evt.") {
            Stream::Events
        } else {
            Stream::Data
        }
    }
}

/// One message in a stream.
///
/// The payload is raw bytes: consumers decode and validate themselves, so a
/// hostile publisher cannot crash the bus, only its own consumers' parse
/// step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream: Stream,
    pub subject: String,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    /// Identity the bus verified at publish time.
    pub publisher: String,
    /// Milliseconds since epoch at append time.
    pub published_at: i64,
    pub payload: Vec<u8>,
}

impl StreamMessage {
    /// Decode the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Append-only log with a retention horizon.
///
/// Sequences keep increasing after truncation; replay from a cursor older
/// than the horizon yields what is still retained.
#[derive(Debug)]
pub struct StreamLog {
    messages: std::collections::VecDeque<StreamMessage>,
    next_sequence: u64,
    retention: usize,
}

impl StreamLog {
    /// Create an empty log retaining at most `retention` messages.
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            messages: std::collections::VecDeque::new(),
            next_sequence: 1,
            retention,
        }
    }

    /// Append a message, assigning its sequence.
    pub fn append(
        &mut self,
        stream: Stream,
        subject: &str,
        publisher: &Identity,
        published_at: i64,
        payload: Vec<u8>,
    ) -> StreamMessage {
        let message = StreamMessage {
            stream,
            subject: subject.to_string(),
            sequence: self.next_sequence,
            publisher: publisher.0.clone(),
            published_at,
            payload,
        };
        self.next_sequence += 1;
        self.messages.push_back(message.clone());
        while self.messages.len() > self.retention {
            self.messages.pop_front();
        }
        message
    }

    /// Messages with sequence strictly greater than `after`, oldest first.
    #[must_use]
    pub fn replay_after(&self, after: u64) -> Vec<StreamMessage> {
        self.messages
            .iter()
            .filter(|m| m.sequence > after)
            .cloned()
            .collect()
    }

    /// Highest assigned sequence (0 when empty).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Oldest retained sequence, if any message is retained.
    #[must_use]
    pub fn horizon(&self) -> Option<u64> {
        self.messages.front().map(|m| m.sequence)
    }
}
