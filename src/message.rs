#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Binding key written by the post-processing stage and read by the
/// postprocessor respond-from mode.
pub const POSTPROCESSOR_BINDING: &str = "postprocessor_response";

/// Per-(message, destination) processing status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Received,
    Filtered,
    Transformed,
    Sent,
    Queued,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Received => "RECEIVED",
            Status::Filtered => "FILTERED",
            Status::Transformed => "TRANSFORMED",
            Status::Sent => "SENT",
            Status::Queued => "QUEUED",
            Status::Error => "ERROR",
        }
    }

    /// Whether a destination attempt carrying this status has settled.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Status::Filtered | Status::Sent | Status::Queued | Status::Error
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority order used when collapsing several destination statuses into one
/// aggregate: the first entry present in the outcome set wins.
pub const RESPONSE_STATUS_PRECEDENCE: [Status; 4] =
    [Status::Error, Status::Queued, Status::Sent, Status::Filtered];

/// Reduces a set of settled statuses to the single winning status, independent
/// of the order the statuses arrived in. Sets without any settled status yield
/// no winner.
pub fn reduce_statuses<I>(statuses: I) -> Option<Status>
where
    I: IntoIterator<Item = Status>,
{
    let seen: Vec<Status> = statuses.into_iter().collect();
    RESPONSE_STATUS_PRECEDENCE
        .iter()
        .copied()
        .find(|candidate| seen.contains(candidate))
}

/// Batch membership for messages produced by splitting one inbound payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchInfo {
    pub id: Uuid,
    pub sequence: u32,
    pub total: u32,
}

impl BatchInfo {
    pub fn new(id: Uuid, sequence: u32, total: u32) -> Self {
        Self {
            id,
            sequence,
            total,
        }
    }
}

/// Message envelope moving through a channel. The payload is immutable once a
/// stage commits; stages produce new envelopes via [`Message::with_content`],
/// while variable bindings and the outcome map are append-only.
#[derive(Clone, Debug)]
pub struct Message {
    id: u64,
    channel_id: String,
    received_at: DateTime<Utc>,
    content: Vec<u8>,
    batch: Option<BatchInfo>,
    bindings: BTreeMap<String, Value>,
    outcomes: BTreeMap<String, DestinationOutcome>,
}

impl Message {
    pub fn new(channel_id: impl Into<String>, id: u64, content: Vec<u8>) -> Self {
        Self {
            id,
            channel_id: channel_id.into(),
            received_at: Utc::now(),
            content,
            batch: None,
            bindings: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    pub fn batch(&self) -> Option<&BatchInfo> {
        self.batch.as_ref()
    }

    pub fn with_batch(mut self, batch: BatchInfo) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Produces the next stage's envelope with a replaced payload. Identity,
    /// bindings and recorded outcomes carry over.
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    pub fn bind(&mut self, key: impl Into<String>, value: Value) {
        self.bindings.insert(key.into(), value);
    }

    pub fn with_binding(mut self, key: impl Into<String>, value: Value) -> Self {
        self.bind(key, value);
        self
    }

    pub fn binding(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.bindings
    }

    pub fn record_outcome(&mut self, outcome: DestinationOutcome) {
        self.outcomes.insert(outcome.destination.clone(), outcome);
    }

    pub fn outcomes(&self) -> &BTreeMap<String, DestinationOutcome> {
        &self.outcomes
    }
}

/// Terminal (or deferred) result of one destination's processing of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationOutcome {
    pub destination: String,
    pub status: Status,
    pub response: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl DestinationOutcome {
    fn new(destination: impl Into<String>, status: Status, attempts: u32) -> Self {
        Self {
            destination: destination.into(),
            status,
            response: None,
            error: None,
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn sent(destination: impl Into<String>, attempts: u32, response: String) -> Self {
        let mut outcome = Self::new(destination, Status::Sent, attempts);
        outcome.response = Some(response);
        outcome
    }

    pub fn queued(destination: impl Into<String>, attempts: u32, last_error: Option<String>) -> Self {
        let mut outcome = Self::new(destination, Status::Queued, attempts);
        outcome.error = last_error;
        outcome
    }

    pub fn errored(destination: impl Into<String>, attempts: u32, error: String) -> Self {
        let mut outcome = Self::new(destination, Status::Error, attempts);
        outcome.error = Some(error);
        outcome
    }

    pub fn filtered(destination: impl Into<String>) -> Self {
        Self::new(destination, Status::Filtered, 0)
    }
}

/// Response handed back to the originating caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub error: Option<String>,
}

impl Response {
    pub fn of(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: None,
        }
    }

    pub fn none(status: Status) -> Self {
        Self::of(status, "")
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: String::new(),
            error: Some(detail.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }
}
