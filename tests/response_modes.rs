#[path = "common/mod.rs"]
mod common;

use common::{
    bindings_for, simple_definition, started_channel, BindingPostprocessor, FailingConnector,
    MarkerTransformer, RecordingConnector, SlowConnector,
};
use courier::adapter::PassthroughAdapter;
use courier::channel::{ChannelBindings, DestinationBinding};
use courier::config::channel::{
    ChannelDefinition, DestinationSettings, QueuePolicy, RespondFrom, SourceSettings,
};
use courier::message::{Status, POSTPROCESSOR_BINDING};
use courier::queue::memory::MemoryQueue;
use courier::resource::SharedResources;
use courier::transform::IdentityTransformer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn destinations_completed_returns_the_delivery_ack() {
    let connector = RecordingConnector::new();
    let channel = started_channel(
        simple_definition("resp-completed", "sink"),
        bindings_for("sink", connector.clone()),
    )
    .await;

    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "ack-1");
    assert_eq!(response.error, None);
    assert_eq!(connector.deliveries(), vec!["hello".to_string()]);

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn error_outcome_outranks_a_successful_sibling() {
    let keeper = RecordingConnector::new();
    let rejecting = FailingConnector::rejecting();

    let definition = ChannelDefinition {
        name: "resp-error-wins".to_string(),
        source: SourceSettings::default(),
        destinations: vec![
            DestinationSettings::new("keep"),
            DestinationSettings::new("reject"),
        ],
    };
    let bindings = ChannelBindings::new(
        Arc::new(PassthroughAdapter),
        Arc::new(IdentityTransformer),
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        "keep",
        Arc::new(IdentityTransformer),
        keeper.clone(),
        Arc::new(MemoryQueue::new()),
    ))
    .destination(DestinationBinding::new(
        "reject",
        Arc::new(IdentityTransformer),
        rejecting.clone(),
        Arc::new(MemoryQueue::new()),
    ));

    let channel = started_channel(definition, bindings).await;
    let response = channel.ingest(b"payload".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Error);
    assert!(
        response.error.as_deref().unwrap_or("").contains("payload refused"),
        "error response should carry the connector failure, got {:?}",
        response.error
    );
    assert_eq!(keeper.count(), 1, "healthy sibling still delivers");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn queued_outcome_outranks_sent() {
    let fast = RecordingConnector::new();
    let parked = RecordingConnector::new();

    let mut queued_settings = DestinationSettings::new("parked");
    queued_settings.queue_policy = QueuePolicy::Always;
    let definition = ChannelDefinition {
        name: "resp-queued-wins".to_string(),
        source: SourceSettings::default(),
        destinations: vec![DestinationSettings::new("fast"), queued_settings],
    };
    let bindings = ChannelBindings::new(
        Arc::new(PassthroughAdapter),
        Arc::new(IdentityTransformer),
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        "fast",
        Arc::new(IdentityTransformer),
        fast.clone(),
        Arc::new(MemoryQueue::new()),
    ))
    .destination(DestinationBinding::new(
        "parked",
        Arc::new(IdentityTransformer),
        parked.clone(),
        Arc::new(MemoryQueue::new()),
    ));

    let channel = started_channel(definition, bindings).await;
    let response = channel.ingest(b"payload".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Queued);

    channel.stop().await.expect("stop");
    assert_eq!(parked.count(), 1, "stop drains the queued delivery");
}

#[tokio::test]
async fn none_mode_answers_with_overall_status_only() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-none", "sink");
    definition.source.respond_from = RespondFrom::None;

    let channel = started_channel(definition, bindings_for("sink", connector)).await;
    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn auto_before_mode_answers_received_even_after_processing() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-auto-before", "sink");
    definition.source.respond_from = RespondFrom::AutoBefore;

    let channel = started_channel(definition, bindings_for("sink", connector.clone())).await;
    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Received);
    assert_eq!(response.message, "Message received.");
    assert_eq!(connector.count(), 1);

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn source_transformed_mode_reports_the_transform_stage() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-transformed", "sink");
    definition.source.respond_from = RespondFrom::SourceTransformed;

    let channel = started_channel(definition, bindings_for("sink", connector)).await;
    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Transformed);
    assert_eq!(response.message, "Message transformed.");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn postprocessor_mode_returns_the_postprocessor_binding() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-post", "sink");
    definition.source.respond_from = RespondFrom::Postprocessor;

    let bindings = bindings_for("sink", connector)
        .with_postprocessor(BindingPostprocessor::text(POSTPROCESSOR_BINDING, "post says done"));
    let channel = started_channel(definition, bindings).await;

    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "post says done");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn named_binding_mode_reads_a_written_binding() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-binding", "sink");
    definition.source.respond_from = RespondFrom::Binding("custom_reply".to_string());

    let bindings = bindings_for("sink", connector)
        .with_postprocessor(BindingPostprocessor::text("custom_reply", "custom payload"));
    let channel = started_channel(definition, bindings).await;

    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");
    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "custom payload");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn missing_binding_falls_back_to_an_empty_response() {
    let connector = RecordingConnector::new();
    let mut definition = simple_definition("resp-binding-missing", "sink");
    definition.source.respond_from = RespondFrom::Binding("never_written".to_string());

    let channel = started_channel(definition, bindings_for("sink", connector)).await;
    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Sent);
    assert_eq!(response.message, "");

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn respond_before_answers_without_waiting_for_destinations() {
    let connector = SlowConnector::holding_for(Duration::from_millis(200));
    let mut definition = simple_definition("resp-early", "sink");
    definition.source.respond_after_processing = false;
    definition.source.respond_from = RespondFrom::AutoBefore;

    let channel = started_channel(definition, bindings_for("sink", connector.clone())).await;

    let started = Instant::now();
    let response = channel.ingest(b"hello".to_vec()).await.expect("ingest");
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "early response must not wait out the connector delay"
    );
    assert_eq!(response.status, Status::Received);
    assert_eq!(response.message, "Message received.");

    channel.stop().await.expect("stop");
    assert_eq!(connector.count(), 1, "stop waits for the detached delivery");
}

#[tokio::test]
async fn source_filter_answers_filtered_and_skips_destinations() {
    let connector = RecordingConnector::new();
    let definition = simple_definition("resp-filtered", "sink");
    let bindings = ChannelBindings::new(
        Arc::new(PassthroughAdapter),
        Arc::new(MarkerTransformer),
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        "sink",
        Arc::new(IdentityTransformer),
        connector.clone(),
        Arc::new(MemoryQueue::new()),
    ));

    let channel = started_channel(definition, bindings).await;
    let response = channel.ingest(b"drop:quietly".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Filtered);
    assert_eq!(response.message, "Message filtered.");
    assert_eq!(connector.count(), 0);

    channel.stop().await.expect("stop");
}

#[tokio::test]
async fn source_transform_error_answers_error_with_detail() {
    let connector = RecordingConnector::new();
    let definition = simple_definition("resp-source-error", "sink");
    let bindings = ChannelBindings::new(
        Arc::new(PassthroughAdapter),
        Arc::new(MarkerTransformer),
        Arc::new(SharedResources::default()),
    )
    .destination(DestinationBinding::new(
        "sink",
        Arc::new(IdentityTransformer),
        connector.clone(),
        Arc::new(MemoryQueue::new()),
    ));

    let channel = started_channel(definition, bindings).await;
    let response = channel.ingest(b"fail:boom".to_vec()).await.expect("ingest");

    assert_eq!(response.status, Status::Error);
    assert!(
        response.error.as_deref().unwrap_or("").contains("boom"),
        "transform detail should reach the response, got {:?}",
        response.error
    );
    assert_eq!(connector.count(), 0);

    channel.stop().await.expect("stop");
}
