#![allow(dead_code)]

use async_trait::async_trait;
use courier::adapter::{AdapterError, InboundAdapter, PassthroughAdapter};
use courier::channel::{Channel, ChannelBindings, DestinationBinding};
use courier::config::channel::{ChannelDefinition, DestinationSettings, SourceSettings};
use courier::connector::{DestinationConnector, DispatchError};
use courier::message::{Message, Response, Status};
use courier::queue::memory::MemoryQueue;
use courier::queue::{DurableQueue, QueueError, QueuedItem};
use courier::resource::SharedResources;
use courier::transform::{
    IdentityTransformer, Postprocessor, StageContext, TransformError, TransformOutcome, Transformer,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Connector that accepts everything and records delivered payloads in order.
#[derive(Default)]
pub struct RecordingConnector {
    deliveries: Mutex<Vec<String>>,
}

impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<String> {
        self.deliveries.lock().expect("deliveries lock").clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().expect("deliveries lock").len()
    }
}

#[async_trait]
impl DestinationConnector for RecordingConnector {
    async fn send(&self, message: &Message) -> Result<String, DispatchError> {
        let text = String::from_utf8_lossy(message.content()).into_owned();
        self.deliveries.lock().expect("deliveries lock").push(text);
        Ok(format!("ack-{}", message.id()))
    }
}

/// Connector that fails the first `times` sends with a retryable error, then
/// delivers normally.
pub struct FlakyConnector {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    deliveries: Mutex<Vec<String>>,
}

impl FlakyConnector {
    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicU32::new(times),
            attempts: AtomicU32::new(0),
            deliveries: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<String> {
        self.deliveries.lock().expect("deliveries lock").clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().expect("deliveries lock").len()
    }
}

#[async_trait]
impl DestinationConnector for FlakyConnector {
    async fn send(&self, message: &Message) -> Result<String, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::failed("synthetic outage"));
        }
        let text = String::from_utf8_lossy(message.content()).into_owned();
        self.deliveries.lock().expect("deliveries lock").push(text);
        Ok(format!("ack-{}", message.id()))
    }
}

/// Connector that never succeeds. `retryable` picks between a transient
/// failure and a permanent rejection.
pub struct FailingConnector {
    attempts: AtomicU32,
    retryable: bool,
}

impl FailingConnector {
    pub fn transient() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            retryable: true,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            retryable: false,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationConnector for FailingConnector {
    async fn send(&self, _message: &Message) -> Result<String, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(DispatchError::failed("connector down"))
        } else {
            Err(DispatchError::rejected("payload refused"))
        }
    }
}

/// Connector that holds every send for a fixed delay and tracks how many
/// sends were in flight at once.
pub struct SlowConnector {
    delay: Duration,
    deliveries: Mutex<Vec<String>>,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
}

impl SlowConnector {
    pub fn holding_for(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            deliveries: Mutex::new(Vec::new()),
            inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().expect("deliveries lock").len()
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationConnector for SlowConnector {
    async fn send(&self, message: &Message) -> Result<String, DispatchError> {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        sleep(self.delay).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let text = String::from_utf8_lossy(message.content()).into_owned();
        self.deliveries.lock().expect("deliveries lock").push(text);
        Ok(format!("ack-{}", message.id()))
    }
}

/// Transformer steered by payload prefixes: `drop:` filters the message,
/// `fail:` raises a transform error, anything else passes through.
pub struct MarkerTransformer;

#[async_trait]
impl Transformer for MarkerTransformer {
    async fn apply(
        &self,
        message: Message,
        stage: &StageContext,
    ) -> Result<TransformOutcome, TransformError> {
        let text = String::from_utf8_lossy(message.content()).into_owned();
        if let Some(detail) = text.strip_prefix("fail:") {
            return Err(TransformError::failed(stage, detail.to_string()));
        }
        if text.starts_with("drop:") {
            return Ok(TransformOutcome::Filtered);
        }
        Ok(TransformOutcome::Transformed(message))
    }
}

/// Transformer that appends `|tag` to the payload so tests can see which
/// stage a delivered body went through.
pub struct TaggingTransformer {
    tag: String,
}

impl TaggingTransformer {
    pub fn new(tag: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { tag: tag.into() })
    }
}

#[async_trait]
impl Transformer for TaggingTransformer {
    async fn apply(
        &self,
        message: Message,
        _stage: &StageContext,
    ) -> Result<TransformOutcome, TransformError> {
        let mut content = message.content().to_vec();
        content.push(b'|');
        content.extend_from_slice(self.tag.as_bytes());
        Ok(TransformOutcome::Transformed(message.with_content(content)))
    }
}

/// Adapter that treats the payload as newline-separated sub-messages.
pub struct LineSplitAdapter;

#[async_trait]
impl InboundAdapter for LineSplitAdapter {
    async fn split(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, AdapterError> {
        if payload.is_empty() {
            return Err(AdapterError::EmptyBatch);
        }
        Ok(payload
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_vec())
            .collect())
    }

    fn auto_response(&self, status: Status) -> Response {
        Response::of(status, format!("lines {}", status.as_str()))
    }
}

/// Postprocessor that writes one fixed binding onto every message.
pub struct BindingPostprocessor {
    key: String,
    value: Value,
}

impl BindingPostprocessor {
    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            value: Value::String(value.into()),
        })
    }
}

#[async_trait]
impl Postprocessor for BindingPostprocessor {
    async fn process(&self, message: &mut Message) -> Result<(), TransformError> {
        message.bind(self.key.clone(), self.value.clone());
        Ok(())
    }
}

/// Queue whose journal is permanently offline.
pub struct FailingQueue;

#[async_trait]
impl DurableQueue for FailingQueue {
    async fn enqueue(&self, _item: QueuedItem) -> Result<(), QueueError> {
        Err(QueueError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "journal offline",
        )))
    }

    async fn dequeue_next(&self) -> Result<Option<QueuedItem>, QueueError> {
        Ok(None)
    }

    async fn acknowledge(&self, _item: &QueuedItem) -> Result<(), QueueError> {
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<QueuedItem>, QueueError> {
        Ok(Vec::new())
    }
}

pub fn simple_definition(channel: &str, destination: &str) -> ChannelDefinition {
    ChannelDefinition {
        name: channel.to_string(),
        source: SourceSettings::default(),
        destinations: vec![DestinationSettings::new(destination)],
    }
}

pub fn bindings_for(
    destination: &str,
    connector: Arc<dyn DestinationConnector>,
) -> ChannelBindings {
    ChannelBindings::new(
        Arc::new(PassthroughAdapter),
        Arc::new(IdentityTransformer),
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        destination,
        Arc::new(IdentityTransformer),
        connector,
        Arc::new(MemoryQueue::new()),
    ))
}

pub async fn started_channel(definition: ChannelDefinition, bindings: ChannelBindings) -> Channel {
    let channel = Channel::new(definition, bindings);
    channel.deploy().expect("deploy");
    channel.start().await.expect("start");
    channel
}

/// Polls `predicate` every 10ms until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
