pub mod journal;
pub mod memory;

use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue record encode failure: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue journal corrupt: {detail}")]
    Corrupt { detail: String },
    #[error("unknown queued item {id}")]
    UnknownItem { id: Uuid },
}

/// Durable snapshot of a transformed message awaiting delivery to one
/// destination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: Uuid,
    pub message_id: u64,
    pub channel_id: String,
    pub destination: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Value>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl QueuedItem {
    /// Captures the transformed message for deferred delivery. `attempts`
    /// records how many dispatch attempts were already spent inline.
    pub fn snapshot(message: &Message, destination: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.id(),
            channel_id: message.channel_id().to_string(),
            destination: destination.into(),
            content: message.content().to_vec(),
            bindings: message.bindings().clone(),
            enqueued_at: Utc::now(),
            attempts,
        }
    }

    /// Rebuilds the message envelope for a redelivery attempt.
    pub fn restore(&self) -> Message {
        let mut message = Message::new(self.channel_id.clone(), self.message_id, self.content.clone());
        for (key, value) in &self.bindings {
            message.bind(key.clone(), value.clone());
        }
        message
    }
}

/// Per-destination ordered store guaranteeing at-least-once redelivery of
/// unacknowledged items across process restarts. Implementations serialize
/// concurrent access internally; the engine drives each queue from a single
/// consumer task.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Appends an item behind everything already queued.
    async fn enqueue(&self, item: QueuedItem) -> Result<(), QueueError>;

    /// Hands out the oldest item not yet delivered to the consumer. The item
    /// stays queued until acknowledged.
    async fn dequeue_next(&self) -> Result<Option<QueuedItem>, QueueError>;

    /// Removes an item after its terminal disposition.
    async fn acknowledge(&self, item: &QueuedItem) -> Result<(), QueueError>;

    /// Returns every unacknowledged item in enqueue order and resets delivery
    /// tracking. Invoked once while a channel starts, before consumption.
    async fn recover(&self) -> Result<Vec<QueuedItem>, QueueError>;
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
