#[path = "common/mod.rs"]
mod common;

use async_trait::async_trait;
use common::{simple_definition, started_channel, LineSplitAdapter, MarkerTransformer, RecordingConnector};
use courier::channel::{ChannelBindings, DestinationBinding};
use courier::connector::{DestinationConnector, DispatchError};
use courier::message::{Message, Status};
use courier::queue::memory::MemoryQueue;
use courier::resource::SharedResources;
use courier::transform::IdentityTransformer;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Connector that records the batch coordinates of every delivered message.
#[derive(Default)]
struct BatchProbeConnector {
    seen: Mutex<Vec<(Uuid, u32, u32)>>,
}

impl BatchProbeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seen(&self) -> Vec<(Uuid, u32, u32)> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl DestinationConnector for BatchProbeConnector {
    async fn send(&self, message: &Message) -> Result<String, DispatchError> {
        let batch = message.batch().expect("batched message");
        self.seen
            .lock()
            .expect("seen lock")
            .push((batch.id, batch.sequence, batch.total));
        Ok(format!("ack-{}", message.id()))
    }
}

fn batch_bindings(
    transformer: Arc<dyn courier::transform::Transformer>,
    connector: Arc<dyn DestinationConnector>,
) -> ChannelBindings {
    ChannelBindings::new(
        Arc::new(LineSplitAdapter),
        transformer,
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        "sink",
        Arc::new(IdentityTransformer),
        connector,
        Arc::new(MemoryQueue::new()),
    ))
}

#[tokio::test]
async fn newline_batches_fan_out_in_order() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("batch-order", "sink");
    definition.source.process_batch = true;

    let channel = started_channel(
        definition,
        batch_bindings(Arc::new(IdentityTransformer), connector.clone()),
    )
    .await;

    let response = channel.ingest(b"alpha\nbeta\ngamma".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "ack-3", "the last sub-message answers");
    assert_eq!(
        connector.deliveries(),
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn first_response_answers_from_the_first_sub_message() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("batch-first", "sink");
    definition.source.process_batch = true;
    definition.source.first_response = true;

    let channel = started_channel(
        definition,
        batch_bindings(Arc::new(IdentityTransformer), connector.clone()),
    )
    .await;

    let response = channel.ingest(b"alpha\nbeta".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "ack-1");
    assert_eq!(connector.count(), 2, "remaining sub-messages still process");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn batch_metadata_numbers_sub_messages() {
    let connector = BatchProbeConnector::new();
    let mut definition = simple_definition("batch-meta", "sink");
    definition.source.process_batch = true;

    let channel = started_channel(
        definition,
        batch_bindings(Arc::new(IdentityTransformer), connector.clone()),
    )
    .await;

    channel.ingest(b"one\ntwo\nthree".to_vec()).await.expect("ingest");
    let seen = connector.seen();
    assert_eq!(seen.len(), 3);

    let batch_id = seen[0].0;
    for (index, (id, sequence, total)) in seen.iter().enumerate() {
        assert_eq!(*id, batch_id, "all sub-messages share one batch id");
        assert_eq!(*sequence, (index + 1) as u32);
        assert_eq!(*total, 3);
    }

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn empty_splits_are_source_errors() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("batch-empty", "sink");
    definition.source.process_batch = true;

    let channel = started_channel(
        definition,
        batch_bindings(Arc::new(IdentityTransformer), connector.clone()),
    )
    .await;

    let response = channel.ingest(b"".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Error);
    assert!(
        response.error.as_deref().unwrap_or("").contains("empty"),
        "adapter rejection should surface, got {:?}",
        response.error
    );

    let response = channel.ingest(b"\n\n".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Error);
    assert!(
        response
            .error
            .as_deref()
            .unwrap_or("")
            .contains("no messages"),
        "a split with nothing in it should surface, got {:?}",
        response.error
    );
    assert_eq!(connector.count(), 0);

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn a_failing_sub_message_does_not_stop_its_siblings() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("batch-partial", "sink");
    definition.source.process_batch = true;

    let channel = started_channel(
        definition,
        batch_bindings(Arc::new(MarkerTransformer), connector.clone()),
    )
    .await;

    let response = channel
        .ingest(b"keep-1\nfail:middle\nkeep-2".to_vec())
        .await
        .expect("ingest");
    assert_eq!(response.status, Status::Sent, "the last sub-message answers");
    assert_eq!(
        connector.deliveries(),
        vec!["keep-1".to_string(), "keep-2".to_string()]
    );

    channel.stop().await.expect("stop");
}
